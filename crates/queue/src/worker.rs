//! Worker harness: leases jobs from one lane and dispatches them to a
//! handler with bounded concurrency and a job-start rate cap.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::job::Lane;
use crate::queue::{JobQueue, LeasedJob};

/// Handler failure, classified for the queue's retry decision.
#[derive(Debug)]
pub enum HandlerError {
    /// Do not retry: the job is discarded into the failed-job log.
    Terminal(anyhow::Error),
    /// Retry via the job's attempt budget and backoff.
    Retryable(anyhow::Error),
}

impl HandlerError {
    pub fn terminal(e: impl Into<anyhow::Error>) -> Self {
        Self::Terminal(e.into())
    }

    pub fn retryable(e: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(e.into())
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Terminal(e) => write!(f, "terminal: {e:#}"),
            Self::Retryable(e) => write!(f, "retryable: {e:#}"),
        }
    }
}

/// Trait for lane-specific job processors.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &LeasedJob) -> Result<(), HandlerError>;
}

/// Admission-control settings for one worker pool.
#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    /// Maximum jobs processed concurrently.
    pub concurrency: u32,
    /// Maximum job starts per second.
    pub rate_per_sec: u32,
    /// Sleep between polls when the lane is idle.
    pub idle_poll: Duration,
}

impl WorkerOptions {
    pub fn new(concurrency: u32, rate_per_sec: u32) -> Self {
        Self {
            concurrency,
            rate_per_sec,
            idle_poll: Duration::from_secs(1),
        }
    }
}

/// Run a worker pool for `lane` until `shutdown` fires.
///
/// The rate cap is enforced by spacing job starts; the concurrency cap by a
/// semaphore whose permit travels into the spawned task. In-flight jobs are
/// not interrupted on shutdown — their leases simply stop being renewed.
pub async fn run_worker(
    queue: Arc<dyn JobQueue>,
    lane: Lane,
    handler: Arc<dyn JobHandler>,
    options: WorkerOptions,
    shutdown: Arc<Notify>,
) {
    info!(
        lane = %lane,
        concurrency = options.concurrency,
        rate_per_sec = options.rate_per_sec,
        "worker pool started"
    );

    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1) as usize));
    let spacing = Duration::from_millis(1000 / u64::from(options.rate_per_sec.max(1)));
    let mut ticker = tokio::time::interval(spacing);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = ticker.tick() => {}
        }

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };

        match queue.lease(lane).await {
            Ok(Some(job)) => {
                let queue = queue.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    process_job(queue, handler, job).await;
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = tokio::time::sleep(options.idle_poll) => {}
                }
            }
            Err(e) => {
                drop(permit);
                warn!(lane = %lane, error = %e, "failed to lease job");
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = tokio::time::sleep(options.idle_poll) => {}
                }
            }
        }
    }

    info!(lane = %lane, "worker pool stopped");
}

async fn process_job(queue: Arc<dyn JobQueue>, handler: Arc<dyn JobHandler>, job: LeasedJob) {
    match handler.handle(&job).await {
        Ok(()) => {
            info!(job_id = %job.id, lane = %job.lane, attempt = job.attempt, "job completed");
            if let Err(e) = queue.ack(&job).await {
                warn!(job_id = %job.id, error = %e, "failed to ack job");
            }
        }
        Err(HandlerError::Terminal(e)) => {
            warn!(job_id = %job.id, lane = %job.lane, error = %format!("{e:#}"), "job failed terminally");
            if let Err(e) = queue.discard(&job, &format!("{e:#}")).await {
                warn!(job_id = %job.id, error = %e, "failed to discard job");
            }
        }
        Err(HandlerError::Retryable(e)) => {
            warn!(job_id = %job.id, lane = %job.lane, attempt = job.attempt, error = %format!("{e:#}"), "job failed");
            if let Err(e) = queue.fail(&job, &format!("{e:#}")).await {
                warn!(job_id = %job.id, error = %e, "failed to reschedule job");
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use crate::job::{JobPayload, RetryPolicy};
    use std::sync::Mutex;
    use uuid::Uuid;

    /// In-memory queue that records every call, for harness tests.
    #[derive(Default)]
    struct RecordingQueue {
        jobs: Mutex<Vec<LeasedJob>>,
        acked: Mutex<Vec<Uuid>>,
        failed: Mutex<Vec<(Uuid, String)>>,
        discarded: Mutex<Vec<(Uuid, String)>>,
    }

    impl RecordingQueue {
        fn push(&self, payload: JobPayload, attempt: u32) -> Uuid {
            let id = Uuid::new_v4();
            self.jobs.lock().unwrap().push(LeasedJob {
                id,
                lane: payload.lane(),
                payload,
                attempt,
                max_attempts: 3,
                backoff_base: Duration::from_millis(5),
            });
            id
        }
    }

    #[async_trait]
    impl JobQueue for RecordingQueue {
        async fn enqueue(
            &self,
            payload: JobPayload,
            _policy: RetryPolicy,
        ) -> Result<Uuid, QueueError> {
            Ok(self.push(payload, 1))
        }

        async fn lease(&self, lane: Lane) -> Result<Option<LeasedJob>, QueueError> {
            let mut jobs = self.jobs.lock().unwrap();
            let pos = jobs.iter().position(|j| j.lane == lane);
            Ok(pos.map(|p| jobs.remove(p)))
        }

        async fn ack(&self, job: &LeasedJob) -> Result<(), QueueError> {
            self.acked.lock().unwrap().push(job.id);
            Ok(())
        }

        async fn fail(&self, job: &LeasedJob, error: &str) -> Result<(), QueueError> {
            self.failed.lock().unwrap().push((job.id, error.to_string()));
            Ok(())
        }

        async fn discard(&self, job: &LeasedJob, error: &str) -> Result<(), QueueError> {
            self.discarded
                .lock()
                .unwrap()
                .push((job.id, error.to_string()));
            Ok(())
        }
    }

    struct OutcomeHandler {
        outcome: fn() -> Result<(), HandlerError>,
    }

    #[async_trait]
    impl JobHandler for OutcomeHandler {
        async fn handle(&self, _job: &LeasedJob) -> Result<(), HandlerError> {
            (self.outcome)()
        }
    }

    #[tokio::test]
    async fn test_success_acks_job() {
        let queue = Arc::new(RecordingQueue::default());
        let id = queue.push(
            JobPayload::Fetch {
                source_id: Uuid::new_v4(),
            },
            1,
        );
        let job = queue.lease(Lane::Fetch).await.unwrap().unwrap();

        process_job(
            queue.clone(),
            Arc::new(OutcomeHandler { outcome: || Ok(()) }),
            job,
        )
        .await;

        assert_eq!(queue.acked.lock().unwrap().as_slice(), &[id]);
        assert!(queue.failed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retryable_failure_reschedules() {
        let queue = Arc::new(RecordingQueue::default());
        let id = queue.push(
            JobPayload::Fetch {
                source_id: Uuid::new_v4(),
            },
            1,
        );
        let job = queue.lease(Lane::Fetch).await.unwrap().unwrap();

        process_job(
            queue.clone(),
            Arc::new(OutcomeHandler {
                outcome: || Err(HandlerError::retryable(anyhow::anyhow!("upstream 503"))),
            }),
            job,
        )
        .await;

        let failed = queue.failed.lock().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, id);
        assert!(failed[0].1.contains("upstream 503"));
        assert!(queue.acked.lock().unwrap().is_empty());
        assert!(queue.discarded.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_failure_discards() {
        let queue = Arc::new(RecordingQueue::default());
        let id = queue.push(
            JobPayload::Forward {
                source_id: Uuid::new_v4(),
                event_ids: vec![],
            },
            1,
        );
        let job = queue.lease(Lane::Forward).await.unwrap().unwrap();

        process_job(
            queue.clone(),
            Arc::new(OutcomeHandler {
                outcome: || Err(HandlerError::terminal(anyhow::anyhow!("source inactive"))),
            }),
            job,
        )
        .await;

        let discarded = queue.discarded.lock().unwrap();
        assert_eq!(discarded.len(), 1);
        assert_eq!(discarded[0].0, id);
        assert!(queue.failed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_worker_loop_drains_lane_and_shuts_down() {
        let queue = Arc::new(RecordingQueue::default());
        for _ in 0..3 {
            queue.push(
                JobPayload::Fetch {
                    source_id: Uuid::new_v4(),
                },
                1,
            );
        }

        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(run_worker(
            queue.clone() as Arc<dyn JobQueue>,
            Lane::Fetch,
            Arc::new(OutcomeHandler { outcome: || Ok(()) }),
            WorkerOptions {
                concurrency: 2,
                rate_per_sec: 100,
                idle_poll: Duration::from_millis(10),
            },
            shutdown.clone(),
        ));

        // Give the pool time to drain all three jobs, then stop it.
        for _ in 0..100 {
            if queue.acked.lock().unwrap().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // notify_one stores a permit, so the wakeup is not lost if the
        // worker is mid-lease rather than parked on the Notify.
        shutdown.notify_one();
        handle.await.unwrap();

        assert_eq!(queue.acked.lock().unwrap().len(), 3);
    }
}
