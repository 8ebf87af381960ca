//! Replays deferred tasks when a reconnect signal arrives.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::queue::SyncQueue;
use super::task::{StoredRequest, SyncFamily, SyncTask, TaskPayload};
use crate::cache::{CacheKey, CacheStorage, PartitionRegistry, PartitionRole};
use crate::http::Request;
use crate::net::Fetcher;

/// Summary of one reconnect signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
  pub family: SyncFamily,
  /// Task ids in the order they were attempted
  pub attempted: Vec<i64>,
  /// Replayed and removed from the queue
  pub succeeded: Vec<i64>,
  /// Left pending for the next signal, reason kept in `last_error`
  pub retry: Vec<i64>,
  /// No replay contract for the payload; left pending
  pub skipped: Vec<i64>,
}

impl SyncReport {
  fn new(family: SyncFamily) -> Self {
    Self {
      family,
      attempted: Vec::new(),
      succeeded: Vec::new(),
      retry: Vec::new(),
      skipped: Vec::new(),
    }
  }

  /// True when nothing is left to retry for this family.
  pub fn is_complete(&self) -> bool {
    self.retry.is_empty() && self.skipped.is_empty()
  }
}

enum ReplayOutcome {
  Done,
  Retry,
  Skipped,
}

/// Sync queue processor.
///
/// Tasks of one family replay strictly in enqueue order, and overlapping
/// signals for the same family are serialized. Families are independent.
/// No task is ever dropped on failure: whatever the server answers, a task
/// that was not confirmed with a 2xx stays pending until a later signal.
/// There is no timer: a task left pending waits for the next signal.
pub struct SyncProcessor<S: CacheStorage> {
  queue: SyncQueue,
  fetcher: Arc<dyn Fetcher>,
  registry: PartitionRegistry<S>,
  family_locks: [Mutex<()>; 3],
}

impl<S: CacheStorage> SyncProcessor<S> {
  pub fn new(queue: SyncQueue, fetcher: Arc<dyn Fetcher>, registry: PartitionRegistry<S>) -> Self {
    Self {
      queue,
      fetcher,
      registry,
      family_locks: [Mutex::new(()), Mutex::new(()), Mutex::new(())],
    }
  }

  pub fn queue(&self) -> &SyncQueue {
    &self.queue
  }

  /// Handle a reconnect signal for `family`. Completes all work before returning.
  pub async fn on_sync(&self, family: SyncFamily) -> SyncReport {
    let _guard = self.family_locks[family.index()].lock().await;
    let mut report = SyncReport::new(family);

    match self.queue.recover(family) {
      Ok(0) => {}
      Ok(recovered) => info!(family = %family, recovered, "Recovered interrupted sync tasks"),
      Err(e) => warn!(family = %family, error = %e, "Failed to recover interrupted sync tasks"),
    }

    let tasks = match self.queue.pending(family) {
      Ok(tasks) => tasks,
      Err(e) => {
        warn!(family = %family, error = %e, "Failed to read sync queue");
        return report;
      }
    };

    info!(family = %family, tasks = tasks.len(), "Replaying deferred tasks");

    for task in tasks {
      report.attempted.push(task.id);
      match self.replay(&task).await {
        ReplayOutcome::Done => report.succeeded.push(task.id),
        ReplayOutcome::Retry => report.retry.push(task.id),
        ReplayOutcome::Skipped => report.skipped.push(task.id),
      }
    }

    info!(
      family = %family,
      succeeded = report.succeeded.len(),
      retry = report.retry.len(),
      skipped = report.skipped.len(),
      "Sync batch finished"
    );
    report
  }

  /// Replay one task. Failures are contained here and never abort the batch.
  async fn replay(&self, task: &SyncTask) -> ReplayOutcome {
    let stored = match &task.payload {
      TaskPayload::Request(stored) => stored,
      TaskPayload::Opaque { .. } => {
        debug!(task_id = task.id, family = %task.family, "No replay contract for payload, leaving pending");
        return ReplayOutcome::Skipped;
      }
    };

    let request = match stored.to_request() {
      Ok(request) => request,
      Err(e) => {
        warn!(task_id = task.id, error = %e, "Undecodable sync task, leaving pending");
        self.record(task, self.queue.mark_pending(task.id, &e.to_string()));
        return ReplayOutcome::Retry;
      }
    };

    if let Err(e) = self.queue.mark_in_flight(task.id) {
      warn!(task_id = task.id, error = %e, "Failed to mark task in flight, leaving pending");
      return ReplayOutcome::Retry;
    }

    match self.fetcher.fetch(request).await {
      Ok(response) if response.is_success() => {
        self.record(task, self.queue.complete(task.id));
        debug!(task_id = task.id, task = %task.describe(), "Replayed sync task");
        self.refresh(stored).await;
        ReplayOutcome::Done
      }
      Ok(response) => {
        let reason = format!("status {}", response.status);
        warn!(task_id = task.id, task = %task.describe(), status = response.status, "Sync task failed, will retry");
        self.record(task, self.queue.mark_pending(task.id, &reason));
        ReplayOutcome::Retry
      }
      Err(e) => {
        warn!(task_id = task.id, task = %task.describe(), error = %e, "Sync task failed, will retry");
        self.record(task, self.queue.mark_pending(task.id, &e.to_string()));
        ReplayOutcome::Retry
      }
    }
  }

  /// Re-read the resource a replay affected into the API partition.
  async fn refresh(&self, stored: &StoredRequest) {
    let Some(refresh) = &stored.refresh_url else {
      return;
    };
    let url = match Url::parse(refresh) {
      Ok(url) => url,
      Err(e) => {
        warn!(url = %refresh, error = %e, "Invalid refresh URL");
        return;
      }
    };

    match self.fetcher.fetch(Request::get(url.clone())).await {
      Ok(response) if response.is_success() => {
        let partition = self.registry.open_role(PartitionRole::Api);
        self
          .registry
          .put(&partition, &CacheKey::for_url(&url), &response);
      }
      Ok(response) => debug!(url = %url, status = response.status, "Refresh not cached"),
      Err(e) => warn!(url = %url, error = %e, "Failed to refresh cache after replay"),
    }
  }

  fn record(&self, task: &SyncTask, result: color_eyre::Result<()>) {
    if let Err(e) = result {
      warn!(task_id = task.id, error = %e, "Failed to record sync task state");
    }
  }
}
