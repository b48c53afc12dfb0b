//! Queue trait and leased-job types.

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::error::QueueError;
use crate::job::{JobPayload, Lane, RetryPolicy};

/// A job currently leased by a worker.
///
/// The queue owns the job row for its lifetime; the worker holds the lease
/// while processing and the queue redelivers if the lease expires without
/// acknowledgment.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub id: Uuid,
    pub lane: Lane,
    pub payload: JobPayload,
    /// 1-based delivery count, incremented when the lease is taken.
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl LeasedJob {
    /// Whether this was the last attempt allowed by the job's budget.
    pub fn budget_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Trait for job queue backends.
///
/// Semantics: durable, at-least-once, per-lane ordering by `run_at` only.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job to its lane. Returns the job ID.
    async fn enqueue(&self, payload: JobPayload, policy: RetryPolicy) -> Result<Uuid, QueueError>;

    /// Lease the next due job in `lane`, or `None` if the lane is idle.
    async fn lease(&self, lane: Lane) -> Result<Option<LeasedJob>, QueueError>;

    /// Acknowledge successful processing — removes the job.
    async fn ack(&self, job: &LeasedJob) -> Result<(), QueueError>;

    /// Record a retryable failure: reschedule with exponential backoff, or
    /// move to the failed-job log once the attempt budget is exhausted.
    async fn fail(&self, job: &LeasedJob, error: &str) -> Result<(), QueueError>;

    /// Record a terminal failure: discard immediately into the failed-job
    /// log regardless of remaining attempts.
    async fn discard(&self, job: &LeasedJob, error: &str) -> Result<(), QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_exhausted() {
        let job = LeasedJob {
            id: Uuid::new_v4(),
            lane: Lane::Fetch,
            payload: JobPayload::Fetch {
                source_id: Uuid::new_v4(),
            },
            attempt: 3,
            max_attempts: 3,
            backoff_base: Duration::from_secs(5),
        };
        assert!(job.budget_exhausted());

        let job = LeasedJob { attempt: 2, ..job };
        assert!(!job.budget_exhausted());
    }
}
