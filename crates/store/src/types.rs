//! Row types for the `sources` and `events` tables.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Row from the `sources` table.
///
/// Credential columns hold AES-256-GCM ciphertext (`iv:tag:ciphertext` hex);
/// decryption happens only inside the credential provider.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SourceRow {
    pub id: Uuid,
    pub credentials_client_email: String,
    pub credentials_private_key: String,
    pub credentials_scopes: Vec<String>,
    /// Fetch cadence in seconds (minimum 60, enforced by the schema).
    pub fetch_interval_secs: i32,
    pub webhook_url: String,
    /// Timestamp up to which events have been fetched. NULL until first pull.
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row from the `events` table.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EventRow {
    pub id: Uuid,
    pub source_id: Uuid,
    pub external_id: String,
    pub event_time: DateTime<Utc>,
    pub actor_email: String,
    pub actor_ip: String,
    pub event_type: String,
    pub status: String,
    pub attributes: serde_json::Value,
    pub ingested_at: DateTime<Utc>,
    pub delivered: bool,
    pub delivery_attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// A normalized remote record, ready for the idempotent bulk insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub external_id: String,
    pub event_time: DateTime<Utc>,
    pub actor_email: String,
    pub actor_ip: String,
    pub event_type: String,
    pub status: String,
    pub attributes: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_row_serializes_attribute_bag() {
        let row = EventRow {
            id: Uuid::new_v4(),
            source_id: Uuid::new_v4(),
            external_id: "ev-1".to_string(),
            event_time: Utc::now(),
            actor_email: "admin@example.com".to_string(),
            actor_ip: "203.0.113.9".to_string(),
            event_type: "LOGIN".to_string(),
            status: "SUCCESS".to_string(),
            attributes: serde_json::json!({"status": "SUCCESS", "login_type": "saml"}),
            ingested_at: Utc::now(),
            delivered: false,
            delivery_attempts: 0,
            last_attempt_at: None,
        };
        let json = serde_json::to_string(&row).unwrap();
        assert!(json.contains("login_type"));
        assert!(json.contains("\"delivered\":false"));
    }
}
