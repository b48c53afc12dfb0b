pub mod error;
pub mod event_store;
pub mod source_store;
pub mod types;

pub use error::StoreError;
pub use event_store::EventStore;
pub use source_store::SourceStore;
pub use types::{EventRow, NewEvent, SourceRow};
