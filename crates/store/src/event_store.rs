//! Operations on the `events` PostgreSQL table.
//!
//! The insert path is a single atomic statement: candidate rows are unnested
//! into a bulk `INSERT ... ON CONFLICT (source_id, external_id) DO NOTHING`,
//! so two overlapping fetches for the same source can race freely — the
//! unique key decides who wins and only the winner's rows come back.

use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{EventRow, NewEvent};

/// Stateless store for `events`.
pub struct EventStore;

impl EventStore {
    /// Bulk upsert-if-absent. Returns the IDs of rows that were actually
    /// inserted; candidates that collided on (source_id, external_id) are
    /// silently skipped.
    pub async fn insert_new(
        pool: &PgPool,
        source_id: Uuid,
        candidates: &[NewEvent],
    ) -> Result<Vec<Uuid>, StoreError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let external_ids: Vec<String> =
            candidates.iter().map(|c| c.external_id.clone()).collect();
        let event_times: Vec<chrono::DateTime<chrono::Utc>> =
            candidates.iter().map(|c| c.event_time).collect();
        let actor_emails: Vec<String> =
            candidates.iter().map(|c| c.actor_email.clone()).collect();
        let actor_ips: Vec<String> = candidates.iter().map(|c| c.actor_ip.clone()).collect();
        let event_types: Vec<String> =
            candidates.iter().map(|c| c.event_type.clone()).collect();
        let statuses: Vec<String> = candidates.iter().map(|c| c.status.clone()).collect();
        let attributes: Vec<serde_json::Value> =
            candidates.iter().map(|c| c.attributes.clone()).collect();

        let inserted: Vec<(Uuid,)> = sqlx::query_as(
            "INSERT INTO events
                (source_id, external_id, event_time, actor_email, actor_ip,
                 event_type, status, attributes)
             SELECT $1, u.external_id, u.event_time, u.actor_email, u.actor_ip,
                    u.event_type, u.status, u.attributes
             FROM UNNEST($2::text[], $3::timestamptz[], $4::text[], $5::text[],
                         $6::text[], $7::text[], $8::jsonb[])
                  AS u(external_id, event_time, actor_email, actor_ip,
                       event_type, status, attributes)
             ON CONFLICT (source_id, external_id) DO NOTHING
             RETURNING id",
        )
        .bind(source_id)
        .bind(&external_ids)
        .bind(&event_times)
        .bind(&actor_emails)
        .bind(&actor_ips)
        .bind(&event_types)
        .bind(&statuses)
        .bind(&attributes)
        .fetch_all(pool)
        .await?;

        debug!(
            source_id = %source_id,
            candidates = candidates.len(),
            inserted = inserted.len(),
            "bulk event insert"
        );

        Ok(inserted.into_iter().map(|(id,)| id).collect())
    }

    /// Fetch the named events that belong to `source_id` and are still
    /// undelivered. Events delivered by an earlier (partially-successful)
    /// attempt drop out here.
    pub async fn undelivered_by_ids(
        pool: &PgPool,
        source_id: Uuid,
        ids: &[Uuid],
    ) -> Result<Vec<EventRow>, StoreError> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, source_id, external_id, event_time, actor_email, actor_ip,
                    event_type, status, attributes, ingested_at, delivered,
                    delivery_attempts, last_attempt_at
             FROM events
             WHERE id = ANY($1) AND source_id = $2 AND delivered = false
             ORDER BY event_time",
        )
        .bind(ids)
        .bind(source_id)
        .fetch_all(pool)
        .await?;

        Ok(rows)
    }

    /// Mark events delivered, stamp the attempt time, and bump the attempt
    /// counter in one bulk update. `delivered` is monotonic — this is the
    /// only transition.
    pub async fn mark_delivered(pool: &PgPool, ids: &[Uuid]) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE events SET
                delivered = true,
                delivery_attempts = delivery_attempts + 1,
                last_attempt_at = now()
             WHERE id = ANY($1) AND delivered = false",
        )
        .bind(ids)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Stamp a failed delivery attempt without flipping `delivered`, so
    /// stuck sources stay observable.
    pub async fn record_attempt(pool: &PgPool, ids: &[Uuid]) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE events SET
                delivery_attempts = delivery_attempts + 1,
                last_attempt_at = now()
             WHERE id = ANY($1) AND delivered = false",
        )
        .bind(ids)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }
}
