//! PostgreSQL-backed job queue.
//!
//! Jobs live in the `jobs` table. Leasing uses `FOR UPDATE SKIP LOCKED` so
//! concurrent workers never double-lease a row; a lease that expires without
//! ack makes the job visible again, which is what makes delivery
//! at-least-once. Jobs that exhaust their attempt budget move to
//! `failed_jobs`, capped at the most recent 100 per lane.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::delay_for_attempt;
use crate::error::QueueError;
use crate::job::{JobPayload, Lane, RetryPolicy};
use crate::queue::{JobQueue, LeasedJob};

/// Rows retained per lane in `failed_jobs`.
const FAILED_RETENTION: i64 = 100;

pub struct PgJobQueue {
    pool: PgPool,
    lease: Duration,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, lease: Duration) -> Self {
        Self { pool, lease }
    }

    /// Move an exhausted or terminally-failed job into `failed_jobs` and
    /// prune that lane's retention window.
    async fn move_to_failed(&self, job: &LeasedJob, error: &str) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO failed_jobs (id, lane, payload, attempts, last_error)
             SELECT id, lane, payload, attempts, $2 FROM jobs WHERE id = $1
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(job.id)
        .bind(error)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "DELETE FROM failed_jobs
             WHERE lane = $1 AND id NOT IN (
                 SELECT id FROM failed_jobs
                 WHERE lane = $1
                 ORDER BY failed_at DESC
                 LIMIT $2
             )",
        )
        .bind(job.lane.as_str())
        .bind(FAILED_RETENTION)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, payload: JobPayload, policy: RetryPolicy) -> Result<Uuid, QueueError> {
        let lane = payload.lane();
        let body = serde_json::to_value(&payload)?;

        let (id,): (Uuid,) = sqlx::query_as(
            "INSERT INTO jobs (lane, payload, max_attempts, backoff_base_ms)
             VALUES ($1, $2, $3, $4)
             RETURNING id",
        )
        .bind(lane.as_str())
        .bind(&body)
        .bind(policy.max_attempts as i32)
        .bind(policy.backoff_base.as_millis() as i64)
        .fetch_one(&self.pool)
        .await?;

        debug!(job_id = %id, lane = %lane, "job enqueued");
        Ok(id)
    }

    async fn lease(&self, lane: Lane) -> Result<Option<LeasedJob>, QueueError> {
        let row: Option<(Uuid, serde_json::Value, i32, i32, i64)> = sqlx::query_as(
            "UPDATE jobs SET
                leased_until = now() + make_interval(secs => $2),
                attempts = attempts + 1
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE lane = $1
                   AND run_at <= now()
                   AND (leased_until IS NULL OR leased_until < now())
                 ORDER BY run_at
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, payload, attempts, max_attempts, backoff_base_ms",
        )
        .bind(lane.as_str())
        .bind(self.lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, body, attempts, max_attempts, backoff_base_ms)) = row else {
            return Ok(None);
        };

        let payload: JobPayload = serde_json::from_value(body)?;

        Ok(Some(LeasedJob {
            id,
            lane,
            payload,
            attempt: attempts.max(1) as u32,
            max_attempts: max_attempts.max(1) as u32,
            backoff_base: Duration::from_millis(backoff_base_ms.max(0) as u64),
        }))
    }

    async fn ack(&self, job: &LeasedJob) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job.id)
            .execute(&self.pool)
            .await?;

        debug!(job_id = %job.id, lane = %job.lane, "job acked");
        Ok(())
    }

    async fn fail(&self, job: &LeasedJob, error: &str) -> Result<(), QueueError> {
        if job.budget_exhausted() {
            warn!(
                job_id = %job.id,
                lane = %job.lane,
                attempts = job.attempt,
                error = %error,
                "job exhausted attempt budget — moving to failed_jobs"
            );
            return self.move_to_failed(job, error).await;
        }

        let delay = delay_for_attempt(job.backoff_base, job.attempt);
        sqlx::query(
            "UPDATE jobs SET
                leased_until = NULL,
                run_at = now() + make_interval(secs => $2),
                last_error = $3
             WHERE id = $1",
        )
        .bind(job.id)
        .bind(delay.as_secs_f64())
        .bind(error)
        .execute(&self.pool)
        .await?;

        info!(
            job_id = %job.id,
            lane = %job.lane,
            attempt = job.attempt,
            retry_in_ms = delay.as_millis() as u64,
            "job rescheduled after failure"
        );
        Ok(())
    }

    async fn discard(&self, job: &LeasedJob, error: &str) -> Result<(), QueueError> {
        warn!(
            job_id = %job.id,
            lane = %job.lane,
            error = %error,
            "job discarded (terminal failure)"
        );
        self.move_to_failed(job, error).await
    }
}
