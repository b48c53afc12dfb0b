//! Shared exponential backoff: delay math for the job queue and a retry
//! loop used inside the HTTP clients.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt - 1)`.
pub fn delay_for_attempt(base: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << shift)
}

/// Exponential backoff policy for in-client retries.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max_retries: u32,
}

impl Backoff {
    pub const fn new(base: Duration, max_retries: u32) -> Self {
        Self { base, max_retries }
    }

    /// Run `op` until it succeeds, a non-retryable error occurs, or the
    /// retry budget is exhausted. `should_retry` classifies errors;
    /// the total number of `op` calls is at most `max_retries + 1`.
    pub async fn retry<T, E, F, Fut, R>(&self, should_retry: R, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
    {
        let mut retries = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if retries < self.max_retries && should_retry(&e) => {
                    retries += 1;
                    let delay = delay_for_attempt(self.base, retries);
                    debug!(
                        retry = retries,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
