//! Job payloads, lanes, and per-lane retry policies.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named queue partition with its own workers and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Fetch,
    Forward,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Fetch => "fetch",
            Lane::Forward => "forward",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of queued work, stored as JSONB in the `jobs` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// Pull one time window of events for a source.
    Fetch { source_id: Uuid },
    /// Deliver a named batch of stored events to the source's webhook.
    Forward {
        source_id: Uuid,
        event_ids: Vec<Uuid>,
    },
}

impl JobPayload {
    /// Which lane this payload belongs to.
    pub fn lane(&self) -> Lane {
        match self {
            JobPayload::Fetch { .. } => Lane::Fetch,
            JobPayload::Forward { .. } => Lane::Forward,
        }
    }

    pub fn source_id(&self) -> Uuid {
        match self {
            JobPayload::Fetch { source_id } | JobPayload::Forward { source_id, .. } => *source_id,
        }
    }
}

/// Retry budget applied when a job is enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Fetch jobs: 3 attempts, backoff base 5s.
    pub const FETCH: Self = Self {
        max_attempts: 3,
        backoff_base: Duration::from_secs(5),
    };

    /// Forward jobs: 5 attempts, backoff base 5s.
    pub const FORWARD: Self = Self {
        max_attempts: 5,
        backoff_base: Duration::from_secs(5),
    };
}

// ── Tests ───────────────────────────────────────────────────────────
