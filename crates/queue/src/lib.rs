pub mod backoff;
pub mod error;
pub mod job;
pub mod pg;
pub mod queue;
pub mod worker;

pub use backoff::Backoff;
pub use error::QueueError;
pub use job::{JobPayload, Lane, RetryPolicy};
pub use pg::PgJobQueue;
pub use queue::{JobQueue, LeasedJob};
pub use worker::{run_worker, HandlerError, JobHandler, WorkerOptions};
