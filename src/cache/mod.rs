//! Partition registry and its storage backends.
//!
//! This module owns every cache partition and entry:
//! - Partitions are named `<prefix>-<role>-<version>` and created lazily
//! - Entries are whole response snapshots keyed by `GET <url>`
//! - Stale generations are removed by an activation sweep
//! - Storage failures degrade to a cache miss or a skipped write

mod entry;
mod registry;
mod storage;

pub use entry::{CacheKey, CachedEntry, Partition, PartitionRole};
pub use registry::PartitionRegistry;
pub use storage::{CacheStorage, MemoryStorage, NoopStorage, SqliteStorage};
pub(crate) use storage::parse_datetime;
