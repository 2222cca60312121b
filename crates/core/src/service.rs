//! The lifecycle contract shared by every ingestion service.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::route::Route;

/// Emitted by a service once a file has been completely written under a
/// user's chroot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteNotification {
    /// The authenticated user the file belongs to.
    pub username: String,
    /// Absolute path of the file on the local filesystem.
    pub path: PathBuf,
}

/// Errors surfaced by service lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Startup(String),
}

/// An ingestion service: it owns a listener (or watcher), authenticates
/// against the route table, confines each user to their chroot, and reports
/// completed writes.
#[async_trait]
pub trait Service: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Starts the service. Listener failures at this point are fatal for
    /// the service.
    async fn start(&mut self) -> Result<(), ServiceError>;

    /// Installs a new route table. Sessions already in flight keep the
    /// routes they authenticated against.
    async fn reload(&self, routes: Vec<Route>) -> Result<(), ServiceError>;

    /// Gracefully stops the service: no new connections, in-progress
    /// notifications drained, channels closed.
    async fn stop(&mut self) -> Result<(), ServiceError>;

    /// Hands out the receiving end of the write-notification channel.
    /// Yields `Some` exactly once.
    fn take_notifications(&mut self) -> Option<mpsc::Receiver<WriteNotification>>;
}
