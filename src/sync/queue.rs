//! Durable queue of sync tasks.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use super::task::{SyncFamily, SyncTask, TaskPayload, TaskState};
use crate::cache::parse_datetime;

/// Trait for sync queue storage backends.
pub trait QueueStorage: Send + Sync {
  /// Append a pending task.
  fn insert(&self, family: SyncFamily, payload: &TaskPayload) -> Result<SyncTask>;

  /// Tasks in enqueue order, optionally for one family.
  fn list(&self, family: Option<SyncFamily>) -> Result<Vec<SyncTask>>;

  /// Record a state change. Entering `InFlight` counts an attempt.
  fn set_state(&self, id: i64, state: TaskState, last_error: Option<&str>) -> Result<()>;

  /// Delete a task. Returns false if it did not exist.
  fn remove(&self, id: i64) -> Result<bool>;

  /// Return tasks left in flight by an interrupted replay to pending.
  fn reset_in_flight(&self) -> Result<usize>;
}

/// In-memory queue storage.
#[derive(Default)]
pub struct MemoryQueue {
  inner: Mutex<(i64, Vec<SyncTask>)>,
}

impl MemoryQueue {
  pub fn new() -> Self {
    Self::default()
  }
}

impl QueueStorage for MemoryQueue {
  fn insert(&self, family: SyncFamily, payload: &TaskPayload) -> Result<SyncTask> {
    let mut inner = self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    inner.0 += 1;
    let task = SyncTask {
      id: inner.0,
      family,
      payload: payload.clone(),
      enqueued_at: Utc::now(),
      state: TaskState::Pending,
      attempts: 0,
      last_error: None,
    };
    inner.1.push(task.clone());
    Ok(task)
  }

  fn list(&self, family: Option<SyncFamily>) -> Result<Vec<SyncTask>> {
    let inner = self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut tasks: Vec<SyncTask> = inner
      .1
      .iter()
      .filter(|t| family.map(|f| t.family == f).unwrap_or(true))
      .cloned()
      .collect();
    tasks.sort_by_key(|t| t.id);
    Ok(tasks)
  }

  fn set_state(&self, id: i64, state: TaskState, last_error: Option<&str>) -> Result<()> {
    let mut inner = self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let task = inner
      .1
      .iter_mut()
      .find(|t| t.id == id)
      .ok_or_else(|| eyre!("Sync task {} not found", id))?;
    if state == TaskState::InFlight {
      task.attempts += 1;
    }
    task.state = state;
    task.last_error = last_error.map(String::from);
    Ok(())
  }

  fn remove(&self, id: i64) -> Result<bool> {
    let mut inner = self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let before = inner.1.len();
    inner.1.retain(|t| t.id != id);
    Ok(inner.1.len() != before)
  }

  fn reset_in_flight(&self) -> Result<usize> {
    let mut inner = self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut reset = 0;
    for task in inner.1.iter_mut().filter(|t| t.state == TaskState::InFlight) {
      task.state = TaskState::Pending;
      reset += 1;
    }
    Ok(reset)
  }
}

/// SQLite-backed queue storage.
pub struct SqliteQueue {
  conn: Mutex<Connection>,
}

/// Schema for the sync queue.
const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    family TEXT NOT NULL,
    payload TEXT NOT NULL,
    enqueued_at TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_tasks_family ON sync_tasks(family, state);
"#;

impl SqliteQueue {
  /// Open (or create) a queue database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory queue database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }
}

type TaskRow = (i64, String, String, String, String, u32, Option<String>);

fn task_from_row(row: TaskRow) -> Result<SyncTask> {
  let (id, family, payload, enqueued_at, state, attempts, last_error) = row;
  let family = SyncFamily::from_tag(&family)
    .ok_or_else(|| eyre!("Unknown sync family '{}' for task {}", family, id))?;
  let payload: TaskPayload = serde_json::from_str(&payload)
    .map_err(|e| eyre!("Failed to decode payload of task {}: {}", id, e))?;
  Ok(SyncTask {
    id,
    family,
    payload,
    enqueued_at: parse_datetime(&enqueued_at)?,
    state: TaskState::parse(&state)?,
    attempts,
    last_error,
  })
}

impl QueueStorage for SqliteQueue {
  fn insert(&self, family: SyncFamily, payload: &TaskPayload) -> Result<SyncTask> {
    let encoded =
      serde_json::to_string(payload).map_err(|e| eyre!("Failed to encode payload: {}", e))?;
    let enqueued_at = Utc::now();

    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT INTO sync_tasks (family, payload, enqueued_at, state) VALUES (?, ?, ?, 'pending')",
        params![family.as_str(), encoded, enqueued_at.to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to enqueue sync task: {}", e))?;

    Ok(SyncTask {
      id: conn.last_insert_rowid(),
      family,
      payload: payload.clone(),
      enqueued_at,
      state: TaskState::Pending,
      attempts: 0,
      last_error: None,
    })
  }

  fn list(&self, family: Option<SyncFamily>) -> Result<Vec<SyncTask>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT id, family, payload, enqueued_at, state, attempts, last_error FROM sync_tasks
         WHERE ?1 IS NULL OR family = ?1
         ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<TaskRow> = stmt
      .query_map(params![family.map(|f| f.as_str())], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
          row.get(6)?,
        ))
      })
      .map_err(|e| eyre!("Failed to list sync tasks: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read sync task row: {}", e))?;

    // Undecodable rows stay in the table for inspection but are never replayed.
    Ok(
      rows
        .into_iter()
        .filter_map(|row| match task_from_row(row) {
          Ok(task) => Some(task),
          Err(e) => {
            warn!(error = %e, "Skipping undecodable sync task");
            None
          }
        })
        .collect(),
    )
  }

  fn set_state(&self, id: i64, state: TaskState, last_error: Option<&str>) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let bump = i64::from(state == TaskState::InFlight);
    let updated = conn
      .execute(
        "UPDATE sync_tasks SET state = ?, last_error = ?, attempts = attempts + ? WHERE id = ?",
        params![state.as_str(), last_error, bump, id],
      )
      .map_err(|e| eyre!("Failed to update sync task {}: {}", id, e))?;

    if updated == 0 {
      return Err(eyre!("Sync task {} not found", id));
    }
    Ok(())
  }

  fn remove(&self, id: i64) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let removed = conn
      .execute("DELETE FROM sync_tasks WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove sync task {}: {}", id, e))?;
    Ok(removed > 0)
  }

  fn reset_in_flight(&self) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "UPDATE sync_tasks SET state = 'pending' WHERE state = 'in-flight'",
        [],
      )
      .map_err(|e| eyre!("Failed to recover in-flight sync tasks: {}", e))
  }
}

/// Handle to the sync task collection. Cloning shares the same storage.
#[derive(Clone)]
pub struct SyncQueue {
  storage: Arc<dyn QueueStorage>,
}

impl SyncQueue {
  /// Wrap a storage backend, recovering tasks interrupted mid-replay.
  pub fn new(storage: impl QueueStorage + 'static) -> Result<Self> {
    let recovered = storage.reset_in_flight()?;
    if recovered > 0 {
      warn!(recovered, "Sync tasks were in flight at shutdown, returned to pending");
    }
    Ok(Self {
      storage: Arc::new(storage),
    })
  }

  pub fn enqueue(&self, family: SyncFamily, payload: TaskPayload) -> Result<SyncTask> {
    let task = self.storage.insert(family, &payload)?;
    info!(task_id = task.id, family = %family, task = %task.describe(), "Deferred task to sync queue");
    Ok(task)
  }

  /// Pending tasks of one family in replay order.
  pub fn pending(&self, family: SyncFamily) -> Result<Vec<SyncTask>> {
    Ok(
      self
        .storage
        .list(Some(family))?
        .into_iter()
        .filter(|t| t.state == TaskState::Pending)
        .collect(),
    )
  }

  /// Every task in the queue, any state.
  pub fn tasks(&self) -> Result<Vec<SyncTask>> {
    self.storage.list(None)
  }

  pub fn mark_in_flight(&self, id: i64) -> Result<()> {
    self.storage.set_state(id, TaskState::InFlight, None)
  }

  pub fn mark_pending(&self, id: i64, error: &str) -> Result<()> {
    self.storage.set_state(id, TaskState::Pending, Some(error))
  }

  /// Return tasks of `family` stranded by an interrupted replay to a replayable state.
  ///
  /// Only valid while no replay of `family` is running. In-flight and failed
  /// rows go back to pending with their last error kept; done rows are removed.
  pub fn recover(&self, family: SyncFamily) -> Result<usize> {
    let mut recovered = 0;
    for task in self.storage.list(Some(family))? {
      match task.state {
        TaskState::Pending => continue,
        TaskState::InFlight | TaskState::Failed => {
          self
            .storage
            .set_state(task.id, TaskState::Pending, task.last_error.as_deref())?;
        }
        TaskState::Done => {
          self.storage.remove(task.id)?;
        }
      }
      recovered += 1;
    }
    Ok(recovered)
  }

  /// Confirm a successful replay: the task passes through `done` and is removed.
  pub fn complete(&self, id: i64) -> Result<()> {
    self.storage.set_state(id, TaskState::Done, None)?;
    self.storage.remove(id)?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn opaque(n: i64) -> TaskPayload {
    TaskPayload::Opaque { data: json!({ "n": n }) }
  }

  fn exercise(queue: SyncQueue) {
    let a = queue.enqueue(SyncFamily::Listings, opaque(1)).unwrap();
    let chat = queue.enqueue(SyncFamily::Chat, opaque(2)).unwrap();
    let b = queue.enqueue(SyncFamily::Listings, opaque(3)).unwrap();

    let pending: Vec<i64> = queue
      .pending(SyncFamily::Listings)
      .unwrap()
      .iter()
      .map(|t| t.id)
      .collect();
    assert_eq!(pending, vec![a.id, b.id]);

    queue.mark_in_flight(a.id).unwrap();
    assert_eq!(queue.pending(SyncFamily::Listings).unwrap().len(), 1);

    queue.mark_pending(a.id, "connection refused").unwrap();
    let a_again = &queue.pending(SyncFamily::Listings).unwrap()[0];
    assert_eq!(a_again.attempts, 1);
    assert_eq!(a_again.last_error.as_deref(), Some("connection refused"));

    queue.complete(b.id).unwrap();
    queue.mark_in_flight(chat.id).unwrap();
    let all = queue.tasks().unwrap();
    assert_eq!(all.len(), 2);
    assert!(queue.pending(SyncFamily::Chat).unwrap().is_empty());
  }

  fn exercise_recover(queue: SyncQueue) {
    let stranded = queue.enqueue(SyncFamily::Listings, opaque(1)).unwrap();
    let confirmed = queue.enqueue(SyncFamily::Listings, opaque(2)).unwrap();
    let failed = queue.enqueue(SyncFamily::Listings, opaque(3)).unwrap();
    let waiting = queue.enqueue(SyncFamily::Listings, opaque(4)).unwrap();
    let other = queue.enqueue(SyncFamily::Chat, opaque(5)).unwrap();

    queue.mark_in_flight(stranded.id).unwrap();
    // A confirmed replay whose row removal never happened.
    queue
      .storage
      .set_state(confirmed.id, TaskState::Done, None)
      .unwrap();
    queue
      .storage
      .set_state(failed.id, TaskState::Failed, Some("status 400"))
      .unwrap();
    queue.mark_in_flight(other.id).unwrap();

    assert_eq!(queue.recover(SyncFamily::Listings).unwrap(), 3);

    let pending = queue.pending(SyncFamily::Listings).unwrap();
    let ids: Vec<i64> = pending.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![stranded.id, failed.id, waiting.id]);
    assert_eq!(pending[0].attempts, 1);
    assert_eq!(pending[1].last_error.as_deref(), Some("status 400"));

    let chat = queue.tasks().unwrap().into_iter().find(|t| t.id == other.id).unwrap();
    assert_eq!(chat.state, TaskState::InFlight);
    assert_eq!(queue.recover(SyncFamily::Listings).unwrap(), 0);
  }

  #[test]
  fn test_memory_queue_recover() {
    exercise_recover(SyncQueue::new(MemoryQueue::new()).unwrap());
  }

  #[test]
  fn test_sqlite_queue_recover() {
    exercise_recover(SyncQueue::new(SqliteQueue::open_in_memory().unwrap()).unwrap());
  }

  #[test]
  fn test_memory_queue() {
    exercise(SyncQueue::new(MemoryQueue::new()).unwrap());
  }

  #[test]
  fn test_sqlite_queue() {
    exercise(SyncQueue::new(SqliteQueue::open_in_memory().unwrap()).unwrap());
  }

  #[test]
  fn test_sqlite_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    let id = {
      let queue = SyncQueue::new(SqliteQueue::open(&path).unwrap()).unwrap();
      let task = queue.enqueue(SyncFamily::Transactions, opaque(1)).unwrap();
      // Simulate a context torn down mid-replay.
      queue.mark_in_flight(task.id).unwrap();
      task.id
    };

    let queue = SyncQueue::new(SqliteQueue::open(&path).unwrap()).unwrap();
    let pending = queue.pending(SyncFamily::Transactions).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].state, TaskState::Pending);
    assert_eq!(pending[0].payload, opaque(1));
  }
}
