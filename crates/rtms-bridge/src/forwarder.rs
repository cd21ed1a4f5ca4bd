//! Transcript forwarding to the ingestion sink.
//!
//! Delivery is best effort and at most once: each transcript frame gets a
//! single POST in its own task. Failures are logged and counted, never
//! retried or queued, and the media channel never waits on them.

use crate::errors::BridgeError;
use crate::observability::metrics;
use common::types::StreamKey;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Connect timeout for the ingestion sink.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for the ingestion sink.
#[derive(Clone, Debug)]
pub struct TranscriptForwarder {
    client: Client,
    ingestion_url: String,
}

impl TranscriptForwarder {
    /// Create a forwarder posting to `ingestion_url`.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Config` if the HTTP client cannot be built.
    pub fn new(ingestion_url: impl Into<String>, timeout: Duration) -> Result<Self, BridgeError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .build()
            .map_err(|e| {
                error!(target: "rtms.forwarder", error = %e, "Failed to build HTTP client");
                BridgeError::Config(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            ingestion_url: ingestion_url.into(),
        })
    }

    /// Fire and forget: deliver `payload` from a detached task.
    ///
    /// The returned handle may be dropped; the task runs to completion
    /// regardless.
    pub fn forward(&self, key: &StreamKey, payload: String) -> JoinHandle<()> {
        let forwarder = self.clone();
        let key = key.clone();

        tokio::spawn(async move {
            let start = Instant::now();
            let bytes = payload.len();

            match forwarder.deliver(&payload).await {
                Ok(()) => {
                    metrics::record_transcript_forward("success", start.elapsed());
                    debug!(
                        target: "rtms.forwarder",
                        stream = %key,
                        bytes,
                        "Transcript forwarded"
                    );
                }
                Err(e) => {
                    metrics::record_transcript_forward("error", start.elapsed());
                    warn!(
                        target: "rtms.forwarder",
                        stream = %key,
                        bytes,
                        error = %e,
                        "Transcript forward failed, dropping"
                    );
                }
            }
        })
    }

    /// One POST of `payload` as the JSON request body.
    ///
    /// # Errors
    ///
    /// `BridgeError::Forward` on connection failure, timeout, or a non-2xx
    /// response.
    pub async fn deliver(&self, payload: &str) -> Result<(), BridgeError> {
        let response = self
            .client
            .post(&self.ingestion_url)
            .header(CONTENT_TYPE, "application/json")
            .body(payload.to_owned())
            .send()
            .await
            .map_err(|e| BridgeError::Forward(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(BridgeError::Forward(format!(
                "ingestion sink returned {status}"
            )))
        }
    }
}
