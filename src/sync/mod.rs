//! Deferred mutations and their replay on reconnect.
//!
//! Failed mutating requests are stored as tasks tagged with a family
//! (listings, chat, transactions). A reconnect signal for a family replays
//! that family's pending tasks in enqueue order:
//! - success removes the task and optionally refreshes a cached read
//! - network failure or 5xx leaves it pending for the next signal
//! - a 4xx rejection keeps it as failed, never replayed again

mod processor;
mod queue;
mod task;

pub use processor::{SyncProcessor, SyncReport};
pub use queue::{MemoryQueue, QueueStorage, SqliteQueue, SyncQueue};
pub use task::{StoredRequest, SyncFamily, SyncTask, TaskPayload, TaskState};
