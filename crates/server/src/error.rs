//! Pipeline error taxonomy.
//!
//! Terminal errors discard the job; retryable errors go back through the
//! queue's attempt budget. The HTTP clients absorb transient failures with
//! their own backoff before anything surfaces here.

use thiserror::Error;
use uuid::Uuid;

use logrelay_queue::{HandlerError, QueueError};
use logrelay_store::StoreError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source not found: {0}")]
    SourceNotFound(Uuid),

    #[error("source inactive: {0}")]
    SourceInactive(Uuid),

    /// Authentication rejected by the upstream. Flips the source inactive.
    #[error("credential error: {0}")]
    Credential(String),

    /// Upstream API failure after the client's own retries were exhausted.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Webhook rejected the payload with a 4xx — retrying cannot help.
    #[error("delivery rejected ({status}): {message}")]
    DeliveryRejected { status: u16, message: String },

    /// Webhook unreachable or 5xx after the client's retries.
    #[error("delivery error: {0}")]
    Delivery(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl PipelineError {
    /// Whether the queue should stop retrying the job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SourceNotFound(_)
                | Self::SourceInactive(_)
                | Self::Credential(_)
                | Self::DeliveryRejected { .. }
        )
    }

    /// Map into the worker harness's retry classification.
    pub fn into_handler_error(self) -> HandlerError {
        if self.is_terminal() {
            HandlerError::terminal(self)
        } else {
            HandlerError::retryable(self)
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
