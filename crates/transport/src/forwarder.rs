//! The single-attempt HTTP forwarder.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use shuttle_core::Shuttle;

use crate::multipart::MultipartBody;
use crate::TransportError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const KEEPALIVE: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// The result of one transport attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// HTTP 2xx: the endpoint has the file, the caller deletes the source.
    Delivered,
    /// Any other HTTP status: permanent failure, the caller parks the file
    /// in `failed/`.
    Rejected { status: u16 },
    /// Transport-layer failure (DNS, refused, timeout, TLS, premature
    /// close): temporary, the caller retries.
    Unreachable { reason: String },
}

/// Performs one multipart POST per shuttle to the shuttle's endpoint.
///
/// The client is shared: connections are pooled with bounded dial, TLS, and
/// header timeouts so no attempt can hang a worker forever.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(KEEPALIVE)
            .read_timeout(READ_TIMEOUT)
            .build()
            .map_err(TransportError::Client)?;

        Ok(Self { client })
    }

    /// One POST of the shuttle's payload to its route endpoint.
    ///
    /// File open/read errors surface as `Err`; everything past that point
    /// is classified into an [`Outcome`].
    pub async fn forward(&self, shuttle: &Shuttle) -> Result<Outcome, TransportError> {
        let encoded = MultipartBody::encode(&shuttle.path, &shuttle.route.username).await?;

        let response = self
            .client
            .post(&shuttle.route.endpoint)
            .header(CONTENT_TYPE, &encoded.content_type)
            .body(encoded.body)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                return Ok(Outcome::Unreachable {
                    reason: e.to_string(),
                })
            }
        };

        let status = response.status();

        // Drain the body so the connection returns to the pool; failures
        // past the status line do not change the classification.
        if let Err(e) = response.bytes().await {
            debug!(error = %e, "failed to drain response body");
        }

        if status.is_success() {
            Ok(Outcome::Delivered)
        } else {
            Ok(Outcome::Rejected {
                status: status.as_u16(),
            })
        }
    }
}
