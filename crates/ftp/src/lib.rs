//! FTP(S) ingestion service.
//!
//! A purpose-built FTP server: route-backed logins, a chroot per user,
//! explicit `AUTH TLS` upgrades, and passive-mode transfers. Deletes and
//! renames are answered positively but not performed, so clients that
//! upload to a temp name and rename still complete their protocol dance
//! while close-write remains the only completion signal.

mod service;
mod session;

pub use service::{FtpConfig, FtpService};

/// Control connections are restarted by the supervisor after this delay
/// when the listener fails.
pub(crate) const RESTART_DELAY_SECS: u64 = 5;

/// How long a passive data connection may take to arrive.
pub(crate) const DATA_ACCEPT_TIMEOUT_SECS: u64 = 30;
