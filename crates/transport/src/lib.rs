//! Outbound transport: multipart encoding and the single-attempt HTTP
//! forwarder.
//!
//! The outcome classification here is the policy the whole system hangs on:
//! protocol-level rejection is permanent, transport-level failure is
//! temporary. A misconfigured endpoint will not spin forever; an endpoint
//! that is momentarily unreachable never loses data.

mod forwarder;
mod multipart;

pub use forwarder::{Forwarder, Outcome};
pub use multipart::MultipartBody;

/// Errors produced while preparing a transport attempt.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
}
