//! SSH + SFTP ingestion service.
//!
//! The SSH transport is `russh`; the SFTP subsystem itself (protocol
//! version 3) is implemented in [`engine`] over the channel's byte stream,
//! which keeps the filesystem semantics — chroot confinement, write
//! tracking, close notifications — in one auditable place and lets the
//! engine be tested without a network.

mod engine;
mod protocol;
mod service;

use std::path::PathBuf;

pub use engine::SftpEngine;
pub use service::{SftpConfig, SftpService};

/// Emitted by an engine when a handle that received writes is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFile {
    /// The authenticated user.
    pub username: String,
    /// Absolute path of the written file.
    pub path: PathBuf,
}

/// Errors surfaced by the SFTP service.
#[derive(Debug, thiserror::Error)]
pub enum SftpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid host key: {0}")]
    HostKey(String),
}

/// Parses an SSH host key from PEM text.
pub fn load_host_key(pem: &str) -> Result<russh_keys::key::KeyPair, SftpError> {
    russh_keys::decode_secret_key(pem, None).map_err(|e| SftpError::HostKey(e.to_string()))
}
