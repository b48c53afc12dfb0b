//! Webhook delivery client.
//!
//! Network failures and 5xx responses retry inside the client; a 4xx means
//! the receiver rejected the payload and is surfaced as terminal.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use logrelay_queue::Backoff;

use crate::error::PipelineError;

/// Capability consumed by the forward handler.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    /// POST `payload` to `webhook_url`, retrying transient failures.
    async fn deliver(&self, webhook_url: &str, payload: &Value) -> Result<(), PipelineError>;
}

enum DeliveryAttemptError {
    Retryable(String),
    Rejected { status: u16, message: String },
}

/// HTTP delivery with a 10-second per-request timeout.
pub struct HttpDeliveryClient {
    backoff: Backoff,
    client: reqwest::Client,
}

impl Default for HttpDeliveryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDeliveryClient {
    pub fn new() -> Self {
        Self {
            backoff: Backoff::new(Duration::from_secs(1), 5),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .user_agent("logrelay/0.1")
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    async fn post_once(
        &self,
        webhook_url: &str,
        payload: &Value,
    ) -> Result<(), DeliveryAttemptError> {
        let response = self
            .client
            .post(webhook_url)
            .json(payload)
            .send()
            .await
            .map_err(|e| DeliveryAttemptError::Retryable(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryAttemptError::Rejected {
                status: status.as_u16(),
                message: body,
            });
        }
        Err(DeliveryAttemptError::Retryable(format!(
            "webhook returned {status}"
        )))
    }
}

#[async_trait]
impl DeliveryClient for HttpDeliveryClient {
    async fn deliver(&self, webhook_url: &str, payload: &Value) -> Result<(), PipelineError> {
        let result = self
            .backoff
            .retry(
                |e| matches!(e, DeliveryAttemptError::Retryable(_)),
                || self.post_once(webhook_url, payload),
            )
            .await;

        match result {
            Ok(()) => {
                debug!(webhook_url = %webhook_url, "webhook delivery succeeded");
                Ok(())
            }
            Err(DeliveryAttemptError::Rejected { status, message }) => {
                Err(PipelineError::DeliveryRejected { status, message })
            }
            Err(DeliveryAttemptError::Retryable(msg)) => Err(PipelineError::Delivery(msg)),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
