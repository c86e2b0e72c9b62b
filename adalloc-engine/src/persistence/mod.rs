//! Durable storage for variant snapshots, registry rows and the learning
//! event log, written behind the in-memory state.

mod event_log;
mod retry;
mod store;
mod writer;

pub use event_log::{EventLog, InMemoryEventLog, JsonlEventLog};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use store::{InMemorySnapshotStore, JsonFileStore, REGISTRY_FILE, SnapshotStore, VARIANTS_FILE};
pub use writer::{PersistenceHandle, PersistenceWriter, WriterStats};
