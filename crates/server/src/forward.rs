//! Forward lane handler: deliver a named batch of stored events to the
//! owning source's webhook.
//!
//! Delivery of a batch is all-or-nothing at the HTTP level, but re-running
//! the job is safe: already-delivered events drop out of the batch query,
//! so a retry only re-sends what never landed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use logrelay_queue::{HandlerError, JobHandler, JobPayload, LeasedJob};
use logrelay_store::{EventRow, EventStore, SourceStore};

use crate::delivery::DeliveryClient;
use crate::error::PipelineError;
use crate::metrics::MetricsSink;

pub struct ForwardHandler {
    pool: PgPool,
    delivery: Arc<dyn DeliveryClient>,
    metrics: Arc<dyn MetricsSink>,
}

impl ForwardHandler {
    pub fn new(
        pool: PgPool,
        delivery: Arc<dyn DeliveryClient>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            pool,
            delivery,
            metrics,
        }
    }

    async fn forward_batch(
        &self,
        source_id: Uuid,
        event_ids: &[Uuid],
    ) -> Result<(), PipelineError> {
        let source = SourceStore::get(&self.pool, source_id)
            .await?
            .ok_or(PipelineError::SourceNotFound(source_id))?;
        if !source.active {
            return Err(PipelineError::SourceInactive(source_id));
        }

        let events = EventStore::undelivered_by_ids(&self.pool, source_id, event_ids).await?;
        let tags = [("source_id", source_id.to_string())];
        if events.is_empty() {
            info!(source_id = %source_id, "no undelivered events in batch");
            self.metrics.record("logs_forwarded", 0.0, &tags);
            return Ok(());
        }

        let payload = build_payload(source_id, &events);
        let result = self.delivery.deliver(&source.webhook_url, &payload).await;

        let ids: Vec<Uuid> = events.iter().map(|e| e.id).collect();
        match result {
            Ok(()) => {
                let marked = EventStore::mark_delivered(&self.pool, &ids).await?;
                self.metrics.record("logs_forwarded", marked as f64, &tags);
                info!(source_id = %source_id, delivered = marked, "batch forwarded");
                Ok(())
            }
            Err(e) => {
                // Stamp the attempt so stuck batches show up in the table;
                // the job outcome is decided by the original error.
                if let Err(stamp_err) = EventStore::record_attempt(&self.pool, &ids).await {
                    warn!(source_id = %source_id, error = %stamp_err, "failed to record delivery attempt");
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl JobHandler for ForwardHandler {
    async fn handle(&self, job: &LeasedJob) -> Result<(), HandlerError> {
        let (source_id, event_ids) = match &job.payload {
            JobPayload::Forward {
                source_id,
                event_ids,
            } => (*source_id, event_ids.as_slice()),
            other => {
                return Err(HandlerError::terminal(anyhow::anyhow!(
                    "forward lane received {:?}",
                    other.lane()
                )))
            }
        };
        self.forward_batch(source_id, event_ids)
            .await
            .map_err(PipelineError::into_handler_error)
    }
}

// ── Payload shape ───────────────────────────────────────────────────

/// Build the webhook body for one batch.
pub fn build_payload(source_id: Uuid, events: &[EventRow]) -> Value {
    let logs: Vec<Value> = events
        .iter()
        .map(|e| {
            let mut details = e.attributes.clone();
            if let Some(obj) = details.as_object_mut() {
                obj.insert("status".to_string(), json!(e.status));
            }
            json!({
                "id": e.external_id,
                "timestamp": e.event_time.to_rfc3339_opts(SecondsFormat::Millis, true),
                "actor": {
                    "email": e.actor_email,
                    "ipAddress": e.actor_ip,
                },
                "eventType": e.event_type,
                "details": details,
                "sourceId": source_id,
            })
        })
        .collect();

    json!({
        "sourceId": source_id,
        "logs": logs,
    })
}

// ── Tests ───────────────────────────────────────────────────────────
