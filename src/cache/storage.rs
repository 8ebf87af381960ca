//! Cache storage trait with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use super::entry::{CacheKey, CachedEntry, Partition};
use crate::http::{Headers, Response};

/// Trait for partition storage backends.
///
/// Every write is atomic: an entry is either stored whole or not at all, and
/// deleting a partition removes all of its entries in one step. Reads return
/// owned copies, so a partition deleted after a read does not affect the
/// entry already handed out.
pub trait CacheStorage: Send + Sync {
  /// Create the partition if it does not exist and return its descriptor.
  fn create_partition(&self, name: &str) -> Result<Partition>;

  /// All partitions in creation order.
  fn partitions(&self) -> Result<Vec<Partition>>;

  /// Delete a partition and all its entries. Returns false if it did not exist.
  fn delete_partition(&self, name: &str) -> Result<bool>;

  /// Store an entry, replacing any previous entry for the same key.
  fn put(&self, partition: &str, entry: &CachedEntry) -> Result<()>;

  /// Look up a key within one partition.
  fn get(&self, partition: &str, key: &CacheKey) -> Result<Option<CachedEntry>>;

  /// Look up a key across all partitions and return the most recently captured
  /// entry. On equal capture times the newer partition wins.
  fn find(&self, key: &CacheKey) -> Result<Option<CachedEntry>>;

  /// Remove a single entry. Returns false if it was absent.
  fn remove(&self, partition: &str, key: &CacheKey) -> Result<bool>;

  /// Keys stored in a partition, sorted.
  fn keys(&self, partition: &str) -> Result<Vec<CacheKey>>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn create_partition(&self, name: &str) -> Result<Partition> {
    Ok(Partition {
      name: name.to_string(),
      created_at: Utc::now(),
    })
  }

  fn partitions(&self) -> Result<Vec<Partition>> {
    Ok(Vec::new())
  }

  fn delete_partition(&self, _name: &str) -> Result<bool> {
    Ok(false)
  }

  fn put(&self, _partition: &str, _entry: &CachedEntry) -> Result<()> {
    Ok(()) // Discard
  }

  fn get(&self, _partition: &str, _key: &CacheKey) -> Result<Option<CachedEntry>> {
    Ok(None) // Always miss
  }

  fn find(&self, _key: &CacheKey) -> Result<Option<CachedEntry>> {
    Ok(None) // Always miss
  }

  fn remove(&self, _partition: &str, _key: &CacheKey) -> Result<bool> {
    Ok(false)
  }

  fn keys(&self, _partition: &str) -> Result<Vec<CacheKey>> {
    Ok(Vec::new())
  }
}

struct MemoryPartition {
  info: Partition,
  entries: HashMap<CacheKey, CachedEntry>,
}

/// In-memory storage. Partitions live in a vector to keep creation order.
#[derive(Default)]
pub struct MemoryStorage {
  partitions: RwLock<Vec<MemoryPartition>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStorage for MemoryStorage {
  fn create_partition(&self, name: &str) -> Result<Partition> {
    let mut partitions = self
      .partitions
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if let Some(existing) = partitions.iter().find(|p| p.info.name == name) {
      return Ok(existing.info.clone());
    }

    let info = Partition {
      name: name.to_string(),
      created_at: Utc::now(),
    };
    partitions.push(MemoryPartition {
      info: info.clone(),
      entries: HashMap::new(),
    });
    Ok(info)
  }

  fn partitions(&self) -> Result<Vec<Partition>> {
    let partitions = self
      .partitions
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(partitions.iter().map(|p| p.info.clone()).collect())
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    let mut partitions = self
      .partitions
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let before = partitions.len();
    partitions.retain(|p| p.info.name != name);
    Ok(partitions.len() != before)
  }

  fn put(&self, partition: &str, entry: &CachedEntry) -> Result<()> {
    self.create_partition(partition)?;
    let mut partitions = self
      .partitions
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // The partition may have been swept between create and write.
    let target = partitions
      .iter_mut()
      .find(|p| p.info.name == partition)
      .ok_or_else(|| eyre!("Partition {} was deleted during write", partition))?;
    target.entries.insert(entry.key.clone(), entry.clone());
    Ok(())
  }

  fn get(&self, partition: &str, key: &CacheKey) -> Result<Option<CachedEntry>> {
    let partitions = self
      .partitions
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      partitions
        .iter()
        .find(|p| p.info.name == partition)
        .and_then(|p| p.entries.get(key).cloned()),
    )
  }

  fn find(&self, key: &CacheKey) -> Result<Option<CachedEntry>> {
    let partitions = self
      .partitions
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      partitions
        .iter()
        .filter_map(|p| p.entries.get(key))
        .max_by_key(|entry| entry.captured_at)
        .cloned(),
    )
  }

  fn remove(&self, partition: &str, key: &CacheKey) -> Result<bool> {
    let mut partitions = self
      .partitions
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      partitions
        .iter_mut()
        .find(|p| p.info.name == partition)
        .map(|p| p.entries.remove(key).is_some())
        .unwrap_or(false),
    )
  }

  fn keys(&self, partition: &str) -> Result<Vec<CacheKey>> {
    let partitions = self
      .partitions
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut keys: Vec<CacheKey> = partitions
      .iter()
      .find(|p| p.info.name == partition)
      .map(|p| p.entries.keys().cloned().collect())
      .unwrap_or_default();
    keys.sort();
    Ok(keys)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) a cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named partitions; id preserves creation order
CREATE TABLE IF NOT EXISTS partitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

-- Response snapshots keyed by request digest
CREATE TABLE IF NOT EXISTS entries (
    partition TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    captured_at TEXT NOT NULL,
    PRIMARY KEY (partition, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_key_hash ON entries(key_hash);
"#;

type EntryRow = (String, u16, String, Vec<u8>, String);

fn read_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn entry_from_row(row: EntryRow) -> Result<CachedEntry> {
  let (request_key, status, headers, body, captured_at) = row;
  let headers: Headers =
    serde_json::from_str(&headers).map_err(|e| eyre!("Failed to decode headers: {}", e))?;
  Ok(CachedEntry {
    key: CacheKey::from_stored(request_key),
    response: Response {
      status,
      headers,
      body: body.into(),
    },
    captured_at: parse_datetime(&captured_at)?,
  })
}

impl CacheStorage for SqliteStorage {
  fn create_partition(&self, name: &str) -> Result<Partition> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO partitions (name, created_at) VALUES (?, ?)",
        params![name, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to create partition {}: {}", name, e))?;

    let created_at: String = conn
      .query_row(
        "SELECT created_at FROM partitions WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to read partition {}: {}", name, e))?;

    Ok(Partition {
      name: name.to_string(),
      created_at: parse_datetime(&created_at)?,
    })
  }

  fn partitions(&self) -> Result<Vec<Partition>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name, created_at FROM partitions ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read partition row: {}", e))?;

    rows
      .into_iter()
      .map(|(name, created_at)| {
        Ok(Partition {
          name,
          created_at: parse_datetime(&created_at)?,
        })
      })
      .collect()
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE partition = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, partition: &str, entry: &CachedEntry) -> Result<()> {
    let headers = serde_json::to_string(&entry.response.headers)
      .map_err(|e| eyre!("Failed to encode headers: {}", e))?;

    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO partitions (name, created_at) VALUES (?, ?)",
      params![partition, Utc::now().to_rfc3339()],
    )
    .map_err(|e| eyre!("Failed to create partition {}: {}", partition, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO entries (partition, key_hash, request_key, status, headers, body, captured_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        partition,
        entry.key.digest(),
        entry.key.as_str(),
        entry.response.status,
        headers,
        entry.response.body.as_ref(),
        entry.captured_at.to_rfc3339(),
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {}: {}", entry.key, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get(&self, partition: &str, key: &CacheKey) -> Result<Option<CachedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row = conn
      .query_row(
        "SELECT request_key, status, headers, body, captured_at FROM entries
         WHERE partition = ? AND key_hash = ?",
        params![partition, key.digest()],
        read_entry_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read entry {}: {}", key, e))?;

    row.map(entry_from_row).transpose()
  }

  fn find(&self, key: &CacheKey) -> Result<Option<CachedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT e.request_key, e.status, e.headers, e.body, e.captured_at FROM entries e
         INNER JOIN partitions p ON p.name = e.partition
         WHERE e.key_hash = ?
         ORDER BY p.id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![key.digest()], read_entry_row)
      .map_err(|e| eyre!("Failed to match entry {}: {}", key, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry row: {}", e))?;

    let mut newest: Option<CachedEntry> = None;
    for row in rows {
      let entry = entry_from_row(row)?;
      if newest
        .as_ref()
        .map_or(true, |n| entry.captured_at >= n.captured_at)
      {
        newest = Some(entry);
      }
    }
    Ok(newest)
  }

  fn remove(&self, partition: &str, key: &CacheKey) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let removed = conn
      .execute(
        "DELETE FROM entries WHERE partition = ? AND key_hash = ?",
        params![partition, key.digest()],
      )
      .map_err(|e| eyre!("Failed to remove entry {}: {}", key, e))?;

    Ok(removed > 0)
  }

  fn keys(&self, partition: &str) -> Result<Vec<CacheKey>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT request_key FROM entries WHERE partition = ? ORDER BY request_key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![partition], |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to list keys of {}: {}", partition, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read key row: {}", e))?;

    Ok(keys.into_iter().map(CacheKey::from_stored).collect())
  }
}

/// Parse an RFC 3339 timestamp written by this module.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
