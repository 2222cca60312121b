//! Shared types for the Shuttle gateway.
//!
//! Everything the protocol services and the launchpad agree on lives here:
//! the route table, the shuttle record, write notifications, the service
//! lifecycle trait, configuration, and chroot path resolution.

pub mod config;
pub mod listing;
pub mod paths;
pub mod route;
pub mod service;
pub mod shuttle;
pub mod tls;

pub use config::{Config, ConfigError, ConfigOverrides};
pub use route::{authenticate, lookup, separate, Route};
pub use service::{Service, ServiceError, WriteNotification};
pub use shuttle::Shuttle;

/// Capacity of every notification and queue channel in the system.
///
/// Uploads complete to disk before they are queued, so a full channel only
/// ever delays forwarding, never ingestion.
pub const CHANNEL_CAPACITY: usize = 100;

/// Reserved directory inside each user's chroot for permanently rejected
/// uploads.
pub const FAILED_DIR: &str = "failed";
