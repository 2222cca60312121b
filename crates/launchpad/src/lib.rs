//! The launchpad: a durable, de-duplicated retry queue for shuttles.
//!
//! Shuttles enter through [`Launchpad::add`], survive process restarts via a
//! full-rewrite log file, and are drained by a pool of workers that forward
//! each payload and act on the transport outcome: delete on delivery, park
//! in `failed/` on rejection, re-queue after a delay on unreachability.

mod enroute;
mod launchpad;
mod log;

pub use launchpad::{Launchpad, Transport};

/// Errors surfaced by launchpad operations.
#[derive(Debug, thiserror::Error)]
pub enum LaunchpadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("shuttle queue closed")]
    QueueClosed,
}
