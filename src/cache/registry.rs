//! Partition registry: named, versioned cache partitions over a storage backend.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::entry::{CacheKey, CachedEntry, Partition, PartitionRole};
use super::storage::CacheStorage;
use crate::http::Response;

/// Registry of cache partitions.
///
/// The registry is best-effort: storage failures are logged and surface as a
/// cache miss or a skipped write, never as an error to the caller.
pub struct PartitionRegistry<S: CacheStorage> {
  storage: Arc<S>,
  prefix: String,
  version: String,
}

impl<S: CacheStorage> PartitionRegistry<S> {
  /// Create a registry over `storage` for the given deployment generation.
  pub fn new(storage: S, prefix: &str, version: &str) -> Self {
    Self {
      storage: Arc::new(storage),
      prefix: prefix.to_string(),
      version: version.to_string(),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// Name of the current partition for `role`.
  pub fn partition_name(&self, role: PartitionRole) -> String {
    role.partition_name(&self.prefix, &self.version)
  }

  /// Names of the current partitions, one per role.
  pub fn current_names(&self) -> BTreeSet<String> {
    PartitionRole::ALL
      .iter()
      .map(|role| self.partition_name(*role))
      .collect()
  }

  /// Return the named partition, creating it if absent.
  pub fn open(&self, name: &str) -> Partition {
    match self.storage.create_partition(name) {
      Ok(partition) => partition,
      Err(e) => {
        // A handle is still usable: writes create the partition lazily.
        warn!(partition = %name, error = %e, "Failed to open cache partition");
        Partition {
          name: name.to_string(),
          created_at: Utc::now(),
        }
      }
    }
  }

  /// Open the current partition for `role`.
  pub fn open_role(&self, role: PartitionRole) -> Partition {
    self.open(&self.partition_name(role))
  }

  /// Store a snapshot of `response` under `key`. Returns false if the write was skipped.
  pub fn put(&self, partition: &Partition, key: &CacheKey, response: &Response) -> bool {
    let entry = CachedEntry::capture(key.clone(), response.clone());
    match self.storage.put(&partition.name, &entry) {
      Ok(()) => {
        debug!(partition = %partition.name, key = %key, "Cached response");
        true
      }
      Err(e) => {
        warn!(partition = %partition.name, key = %key, error = %e, "Skipped cache write");
        false
      }
    }
  }

  /// Exact-match lookup across all partitions, most recent capture first.
  pub fn match_key(&self, key: &CacheKey) -> Option<CachedEntry> {
    self.storage.find(key).unwrap_or_else(|e| {
      warn!(key = %key, error = %e, "Cache lookup failed, treating as miss");
      None
    })
  }

  /// Exact-match lookup in the current partition for `role`. Never creates the partition.
  pub fn match_in(&self, role: PartitionRole, key: &CacheKey) -> Option<CachedEntry> {
    let name = self.partition_name(role);
    self.storage.get(&name, key).unwrap_or_else(|e| {
      warn!(partition = %name, key = %key, error = %e, "Cache lookup failed, treating as miss");
      None
    })
  }

  /// Explicitly remove one entry.
  pub fn remove(&self, partition: &Partition, key: &CacheKey) -> bool {
    self.storage.remove(&partition.name, key).unwrap_or_else(|e| {
      warn!(partition = %partition.name, key = %key, error = %e, "Failed to remove cache entry");
      false
    })
  }

  /// Remove `key` from every partition. Returns the partitions it was removed from.
  pub fn evict(&self, key: &CacheKey) -> Vec<String> {
    let evicted: Vec<String> = self
      .partitions()
      .into_iter()
      .filter(|partition| self.remove(partition, key))
      .map(|partition| partition.name)
      .collect();
    info!(key = %key, partitions = evicted.len(), "Evicted cache entry");
    evicted
  }

  /// All partitions in creation order.
  pub fn partitions(&self) -> Vec<Partition> {
    self.storage.partitions().unwrap_or_else(|e| {
      warn!(error = %e, "Failed to list cache partitions");
      Vec::new()
    })
  }

  /// Keys held by a partition.
  pub fn keys(&self, partition: &Partition) -> Vec<CacheKey> {
    self.storage.keys(&partition.name).unwrap_or_else(|e| {
      warn!(partition = %partition.name, error = %e, "Failed to list cache keys");
      Vec::new()
    })
  }

  /// Delete every partition whose name is not in `current`.
  ///
  /// Idempotent. Each partition is deleted atomically by the storage layer,
  /// and entries already matched are owned copies, so concurrent readers
  /// never observe a partially deleted partition.
  pub fn sweep(&self, current: &BTreeSet<String>) -> Vec<String> {
    let mut removed = Vec::new();
    for partition in self.partitions() {
      if current.contains(&partition.name) {
        continue;
      }
      match self.storage.delete_partition(&partition.name) {
        Ok(true) => {
          info!(partition = %partition.name, "Deleted stale cache partition");
          removed.push(partition.name);
        }
        Ok(false) => {}
        Err(e) => warn!(partition = %partition.name, error = %e, "Failed to delete stale partition"),
      }
    }
    removed
  }
}

impl<S: CacheStorage> Clone for PartitionRegistry<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      prefix: self.prefix.clone(),
      version: self.version.clone(),
    }
  }
}
