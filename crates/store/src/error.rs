//! Store error types.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("source not found: {0}")]
    SourceNotFound(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
