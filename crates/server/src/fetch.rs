//! Fetch lane handler: pull one time window of audit records for a source,
//! normalize them, dedup-insert into the event store, and hand the new rows
//! to the forward lane.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use logrelay_queue::{HandlerError, JobHandler, JobPayload, JobQueue, LeasedJob, RetryPolicy};
use logrelay_store::{EventStore, NewEvent, SourceStore};

use crate::credentials::CredentialProvider;
use crate::error::PipelineError;
use crate::metrics::MetricsSink;
use crate::remote::{RawRecord, RemoteLogClient};

/// Windows shorter than this are skipped rather than fetched.
const MIN_WINDOW_SECS: i64 = 60;
/// Lookback for a source that has never fetched.
const INITIAL_LOOKBACK_HOURS: i64 = 1;

pub struct FetchHandler {
    pool: PgPool,
    queue: Arc<dyn JobQueue>,
    credentials: Arc<dyn CredentialProvider>,
    remote: Arc<dyn RemoteLogClient>,
    metrics: Arc<dyn MetricsSink>,
}

impl FetchHandler {
    pub fn new(
        pool: PgPool,
        queue: Arc<dyn JobQueue>,
        credentials: Arc<dyn CredentialProvider>,
        remote: Arc<dyn RemoteLogClient>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            pool,
            queue,
            credentials,
            remote,
            metrics,
        }
    }

    async fn fetch_source(&self, source_id: Uuid) -> Result<(), PipelineError> {
        let started = Instant::now();

        let source = SourceStore::get(&self.pool, source_id)
            .await?
            .ok_or(PipelineError::SourceNotFound(source_id))?;
        if !source.active {
            return Err(PipelineError::SourceInactive(source_id));
        }

        let end = Utc::now();
        let start = source
            .last_fetch_at
            .unwrap_or_else(|| end - ChronoDuration::hours(INITIAL_LOOKBACK_HOURS));

        if (end - start).num_seconds() < MIN_WINDOW_SECS {
            info!(source_id = %source_id, "fetch window too small, skipping");
            return Ok(());
        }

        let creds = match self.credentials.resolve(&source).await {
            Ok(c) => c,
            Err(e @ PipelineError::Credential(_)) => {
                return Err(self.deactivate_for(source_id, e).await);
            }
            Err(e) => return Err(e),
        };

        let records = match self.remote.fetch_window(&creds.access_token, start, end).await {
            Ok(r) => r,
            Err(e @ PipelineError::Credential(_)) => {
                return Err(self.deactivate_for(source_id, e).await);
            }
            Err(e) => return Err(e),
        };

        let candidates = normalize_records(&records, end);
        let new_ids = EventStore::insert_new(&self.pool, source_id, &candidates).await?;

        // The watermark advances even when the window was empty, so quiet
        // sources do not refetch an ever-growing range.
        SourceStore::advance_watermark(&self.pool, source_id, end).await?;

        if !new_ids.is_empty() {
            self.queue
                .enqueue(
                    JobPayload::Forward {
                        source_id,
                        event_ids: new_ids.clone(),
                    },
                    RetryPolicy::FORWARD,
                )
                .await?;
        }

        record_fetch_metrics(
            self.metrics.as_ref(),
            source_id,
            candidates.len(),
            new_ids.len(),
            started.elapsed(),
        );

        info!(
            source_id = %source_id,
            fetched = candidates.len(),
            new = new_ids.len(),
            "fetch complete"
        );
        Ok(())
    }

    /// Flip the source inactive after an auth failure, keeping the original
    /// error as the job's cause.
    async fn deactivate_for(&self, source_id: Uuid, cause: PipelineError) -> PipelineError {
        warn!(source_id = %source_id, error = %cause, "credential failure, deactivating source");
        if let Err(e) = SourceStore::deactivate(&self.pool, source_id).await {
            warn!(source_id = %source_id, error = %e, "failed to deactivate source");
        }
        cause
    }
}

#[async_trait]
impl JobHandler for FetchHandler {
    async fn handle(&self, job: &LeasedJob) -> Result<(), HandlerError> {
        let source_id = job.payload.source_id();
        self.fetch_source(source_id)
            .await
            .map_err(PipelineError::into_handler_error)
    }
}

/// `logs_fetched` counts only rows that were actually inserted; records
/// that lost the dedup race show up in `logs_received` instead.
fn record_fetch_metrics(
    metrics: &dyn MetricsSink,
    source_id: Uuid,
    received: usize,
    inserted: usize,
    elapsed: Duration,
) {
    let tags = [("source_id", source_id.to_string())];
    metrics.record("logs_received", received as f64, &tags);
    metrics.record("logs_fetched", inserted as f64, &tags);
    metrics.record("fetch_duration_ms", elapsed.as_millis() as f64, &tags);
}

// ── Normalization ───────────────────────────────────────────────────

/// Flatten raw upstream records into store candidates.
///
/// Records without an upstream ID get a synthetic one; dedup then hinges on
/// the upstream being consistent about which records carry IDs.
pub fn normalize_records(records: &[RawRecord], fallback_time: DateTime<Utc>) -> Vec<NewEvent> {
    records
        .iter()
        .map(|record| {
            let external_id = match &record.id {
                Some(id) if !id.is_empty() => id.clone(),
                _ => format!(
                    "generated-{}-{}",
                    fallback_time.timestamp_millis(),
                    Uuid::new_v4()
                ),
            };

            let first_event = record.events.first();
            let event_type = first_event
                .and_then(|e| e.name.clone())
                .unwrap_or_else(|| "unknown".to_string());
            let status = first_event
                .map(|e| extract_status(&e.parameters))
                .unwrap_or_else(|| "UNKNOWN".to_string());

            let actor_email = record
                .actor
                .email
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            let actor_ip = record
                .actor
                .caller_ip
                .clone()
                .or_else(|| record.actor.ip_address.clone())
                .unwrap_or_else(|| "unknown".to_string());

            let attributes = json!({
                "events": record
                    .events
                    .iter()
                    .map(|e| {
                        json!({
                            "name": e.name,
                            "parameters": e
                                .parameters
                                .iter()
                                .map(|p| json!({ "name": p.name, "value": p.value }))
                                .collect::<Vec<_>>(),
                        })
                    })
                    .collect::<Vec<_>>(),
            });

            NewEvent {
                external_id,
                event_time: record.time.unwrap_or(fallback_time),
                actor_email,
                actor_ip,
                event_type,
                status,
                attributes,
            }
        })
        .collect()
}

fn extract_status(parameters: &[crate::remote::RawParameter]) -> String {
    parameters
        .iter()
        .find(|p| p.name.as_deref() == Some("status"))
        .and_then(|p| p.value.as_ref())
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::test_support::CapturingSink;
    use crate::remote::{RawActor, RawEvent, RawParameter};

    fn record(id: Option<&str>) -> RawRecord {
        RawRecord {
            id: id.map(str::to_string),
            time: Some("2024-03-01T10:15:00Z".parse::<DateTime<Utc>>().unwrap()),
            actor: RawActor {
                email: Some("admin@example.com".to_string()),
                caller_ip: Some("10.0.0.1".to_string()),
                ip_address: None,
            },
            events: vec![RawEvent {
                name: Some("LOGIN_SUCCESS".to_string()),
                parameters: vec![RawParameter {
                    name: Some("status".to_string()),
                    value: Some(serde_json::json!("SUCCESS")),
                }],
            }],
        }
    }

    #[test]
    fn test_normalize_full_record() {
        let now = Utc::now();
        let events = normalize_records(&[record(Some("evt-1"))], now);
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e.external_id, "evt-1");
        assert_eq!(e.event_type, "LOGIN_SUCCESS");
        assert_eq!(e.status, "SUCCESS");
        assert_eq!(e.actor_email, "admin@example.com");
        assert_eq!(e.actor_ip, "10.0.0.1");
        assert_eq!(e.event_time, "2024-03-01T10:15:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn test_normalize_generates_id_when_missing() {
        let now = Utc::now();
        let events = normalize_records(&[record(None), record(Some(""))], now);
        assert!(events[0].external_id.starts_with("generated-"));
        assert!(events[1].external_id.starts_with("generated-"));
        // Synthetic IDs must not collide within a batch.
        assert_ne!(events[0].external_id, events[1].external_id);
    }

    #[test]
    fn test_normalize_defaults_for_sparse_record() {
        let now = Utc::now();
        let sparse = RawRecord {
            id: Some("evt-2".to_string()),
            time: None,
            actor: RawActor::default(),
            events: vec![],
        };
        let events = normalize_records(&[sparse], now);
        let e = &events[0];
        assert_eq!(e.event_type, "unknown");
        assert_eq!(e.status, "UNKNOWN");
        assert_eq!(e.actor_email, "unknown");
        assert_eq!(e.actor_ip, "unknown");
        assert_eq!(e.event_time, now);
    }

    #[test]
    fn test_normalize_ip_falls_back_to_ip_address() {
        let now = Utc::now();
        let mut r = record(Some("evt-3"));
        r.actor.caller_ip = None;
        r.actor.ip_address = Some("192.168.1.9".to_string());
        let events = normalize_records(&[r], now);
        assert_eq!(events[0].actor_ip, "192.168.1.9");
    }

    #[test]
    fn test_normalize_status_missing_parameter() {
        let now = Utc::now();
        let mut r = record(Some("evt-4"));
        r.events[0].parameters.clear();
        let events = normalize_records(&[r], now);
        assert_eq!(events[0].status, "UNKNOWN");
    }

    #[test]
    fn test_fetched_metric_counts_only_inserted_rows() {
        // A dup-heavy overlapping window returns records that all collide
        // on the dedup key; fetched must report zero, not the raw count.
        let sink = CapturingSink::default();
        record_fetch_metrics(&sink, Uuid::new_v4(), 5, 0, Duration::from_millis(12));

        let recorded = sink.recorded.lock().unwrap();
        assert!(recorded.contains(&("logs_received".to_string(), 5.0)));
        assert!(recorded.contains(&("logs_fetched".to_string(), 0.0)));
    }

    #[test]
    fn test_fetched_metric_reports_inserted_subset() {
        let sink = CapturingSink::default();
        record_fetch_metrics(&sink, Uuid::new_v4(), 8, 3, Duration::from_millis(40));

        let recorded = sink.recorded.lock().unwrap();
        assert!(recorded.contains(&("logs_fetched".to_string(), 3.0)));
    }

    #[test]
    fn test_normalize_preserves_all_sub_events_in_attributes() {
        let now = Utc::now();
        let mut r = record(Some("evt-5"));
        r.events.push(RawEvent {
            name: Some("LOGOUT".to_string()),
            parameters: vec![],
        });
        let events = normalize_records(&[r], now);
        let attrs = &events[0].attributes;
        assert_eq!(attrs["events"].as_array().unwrap().len(), 2);
        // The primary event type still comes from the first sub-event.
        assert_eq!(events[0].event_type, "LOGIN_SUCCESS");
    }
}
