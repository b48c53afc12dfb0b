//! logrelay-server — the ingestion-and-delivery pipeline.
//!
//! Pulls audit events from credentialed remote sources on a per-source
//! cadence, deduplicates them into PostgreSQL, and forwards new events to
//! each source's webhook. The scheduler and both worker pools run inside
//! one process; `Scheduler::schedule_source` / `remove_schedule` are the
//! hooks the external registration API calls.

pub mod credentials;
pub mod db;
pub mod delivery;
pub mod error;
pub mod fetch;
pub mod forward;
pub mod metrics;
pub mod remote;
pub mod scheduler;

pub use error::PipelineError;
pub use scheduler::Scheduler;
