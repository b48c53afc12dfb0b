//! Operations on the `sources` PostgreSQL table.
//!
//! [`SourceStore`] is a stateless unit struct with async methods that take a
//! `&PgPool`. The pipeline only needs reads plus two narrow mutations:
//! deactivation (on credential failure) and watermark advancement.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::SourceRow;

const SOURCE_COLUMNS: &str = "id, credentials_client_email, credentials_private_key, \
     credentials_scopes, fetch_interval_secs, webhook_url, last_fetch_at, \
     active, created_at, updated_at";

/// Stateless store for `sources`.
pub struct SourceStore;

impl SourceStore {
    /// Get a single source by ID.
    pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<SourceRow>, StoreError> {
        let row = sqlx::query_as::<_, SourceRow>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(row)
    }

    /// List all active sources, oldest first.
    pub async fn list_active(pool: &PgPool) -> Result<Vec<SourceRow>, StoreError> {
        let rows = sqlx::query_as::<_, SourceRow>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE active = true ORDER BY created_at"
        ))
        .fetch_all(pool)
        .await?;

        Ok(rows)
    }

    /// Mark a source inactive (credential failure path).
    ///
    /// Idempotent: deactivating an already-inactive source is a no-op.
    pub async fn deactivate(pool: &PgPool, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sources SET active = false, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::SourceNotFound(id));
        }

        Ok(())
    }

    /// Advance the fetch watermark to `end`.
    ///
    /// `GREATEST` keeps the watermark monotonically non-decreasing even if
    /// two overlapping fetch jobs complete out of order.
    pub async fn advance_watermark(
        pool: &PgPool,
        id: Uuid,
        end: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sources SET
                last_fetch_at = GREATEST(COALESCE(last_fetch_at, 'epoch'::timestamptz), $2),
                updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(end)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::SourceNotFound(id));
        }

        Ok(())
    }
}
