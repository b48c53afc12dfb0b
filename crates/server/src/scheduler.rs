//! Per-source fetch scheduler.
//!
//! Each active source owns one trigger task that enqueues a fetch job on the
//! source's cadence. A reconcile loop re-reads the sources table every
//! minute, so sources registered, deactivated, or re-tuned by the external
//! API converge without a restart. Registration also calls
//! [`Scheduler::schedule_source`] directly for an immediate first fetch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use logrelay_queue::{JobPayload, JobQueue, RetryPolicy};
use logrelay_store::{SourceRow, SourceStore};

use crate::error::PipelineError;

const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// One source's live trigger. Dropping it aborts the fire loop.
struct Trigger {
    interval_minutes: u32,
    handle: JoinHandle<()>,
}

impl Drop for Trigger {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Fetch cadence in whole minutes, floored at one.
fn cadence_minutes(fetch_interval_secs: i32) -> u32 {
    (fetch_interval_secs.max(0) as u32 / 60).max(1)
}

pub struct Scheduler {
    pool: PgPool,
    queue: Arc<dyn JobQueue>,
    triggers: Mutex<HashMap<Uuid, Trigger>>,
}

impl Scheduler {
    pub fn new(pool: PgPool, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            pool,
            queue,
            triggers: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile loop. Runs until `shutdown` fires; triggers die with the
    /// scheduler when it is dropped.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        info!("scheduler started");
        loop {
            if let Err(e) = self.reconcile().await {
                warn!(error = %e, "scheduler reconcile failed");
            }
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = tokio::time::sleep(RECONCILE_INTERVAL) => {}
            }
        }
        self.triggers.lock().unwrap_or_else(|e| e.into_inner()).clear();
        info!("scheduler stopped");
    }

    /// Align the trigger map with the set of active sources.
    pub async fn reconcile(&self) -> Result<(), PipelineError> {
        let sources = SourceStore::list_active(&self.pool).await?;

        let mut desired: HashMap<Uuid, u32> = HashMap::with_capacity(sources.len());
        for source in &sources {
            desired.insert(source.id, cadence_minutes(source.fetch_interval_secs));
        }

        let mut triggers = self.triggers.lock().unwrap_or_else(|e| e.into_inner());

        let before = triggers.len();
        triggers.retain(|id, _| desired.contains_key(id));
        let removed = before - triggers.len();

        let mut added = 0usize;
        for (id, interval_minutes) in desired {
            let stale = triggers
                .get(&id)
                .map(|t| t.interval_minutes != interval_minutes)
                .unwrap_or(true);
            if stale {
                triggers.insert(id, self.spawn_trigger(id, interval_minutes));
                added += 1;
            }
        }

        if added > 0 || removed > 0 {
            info!(active = triggers.len(), added, removed, "scheduler reconciled");
        }
        Ok(())
    }

    /// Install (or refresh) a source's trigger and enqueue an immediate
    /// fetch. Called by the registration path.
    pub async fn schedule_source(&self, source_id: Uuid) -> Result<(), PipelineError> {
        let source = SourceStore::get(&self.pool, source_id).await?;
        let interval_minutes = self.install_trigger(source_id, source.as_ref())?;

        self.queue
            .enqueue(JobPayload::Fetch { source_id }, RetryPolicy::FETCH)
            .await?;

        info!(source_id = %source_id, interval_minutes, "source scheduled");
        Ok(())
    }

    /// Replace the trigger for a live source. A missing or inactive source
    /// drops any stale trigger instead, so a deletion or deactivation that
    /// races the registration path never leaves a timer running until the
    /// next reconcile.
    fn install_trigger(
        &self,
        source_id: Uuid,
        source: Option<&SourceRow>,
    ) -> Result<u32, PipelineError> {
        let Some(source) = source else {
            self.remove_schedule(source_id);
            return Err(PipelineError::SourceNotFound(source_id));
        };
        if !source.active {
            self.remove_schedule(source_id);
            return Err(PipelineError::SourceInactive(source_id));
        }

        let interval_minutes = cadence_minutes(source.fetch_interval_secs);
        self.triggers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(source_id, self.spawn_trigger(source_id, interval_minutes));
        Ok(interval_minutes)
    }

    /// Tear down a source's trigger. Idempotent.
    pub fn remove_schedule(&self, source_id: Uuid) {
        let removed = self
            .triggers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&source_id)
            .is_some();
        if removed {
            info!(source_id = %source_id, "source unscheduled");
        }
    }

    fn spawn_trigger(&self, source_id: Uuid, interval_minutes: u32) -> Trigger {
        let queue = self.queue.clone();
        let period = Duration::from_secs(u64::from(interval_minutes) * 60);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; the immediate fetch is
            // the registration path's job, not the trigger's.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = queue
                    .enqueue(JobPayload::Fetch { source_id }, RetryPolicy::FETCH)
                    .await
                {
                    warn!(source_id = %source_id, error = %e, "failed to enqueue fetch job");
                }
            }
        });
        Trigger {
            interval_minutes,
            handle,
        }
    }

    #[cfg(test)]
    fn trigger_intervals(&self) -> HashMap<Uuid, u32> {
        self.triggers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, t)| (*id, t.interval_minutes))
            .collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────────
