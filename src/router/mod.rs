//! Request interception: classify every request and run its caching strategy.

mod classify;

pub use classify::{BypassReason, Classifier, RequestClass};

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use url::Url;

use crate::cache::{CacheKey, CacheStorage, CachedEntry, PartitionRegistry, PartitionRole};
use crate::http::{Request, Response};
use crate::net::Fetcher;
use crate::sync::{StoredRequest, SyncQueue, TaskPayload};

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh data from network
  Network,
  /// Served from a cache partition
  Cache,
  /// Synthesized offline JSON or empty 503
  Offline,
  /// The offline placeholder page, cached or built in
  OfflinePage,
  /// A failed mutation accepted into the sync queue
  Queued,
}

/// A response plus the path that produced it.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: ResponseSource,
  pub class: RequestClass,
  /// Capture time of the cache entry, when one was served
  pub captured_at: Option<DateTime<Utc>>,
}

/// What a strategy produced, before the request class is attached.
struct Answer {
  response: Response,
  source: ResponseSource,
  captured_at: Option<DateTime<Utc>>,
}

impl Answer {
  fn new(response: Response, source: ResponseSource) -> Self {
    Self {
      response,
      source,
      captured_at: None,
    }
  }

  fn cached(entry: CachedEntry, source: ResponseSource) -> Self {
    Self {
      response: entry.response,
      source,
      captured_at: Some(entry.captured_at),
    }
  }
}

/// Fallback used by network-first strategies once the cache misses.
#[derive(Debug, Clone, Copy)]
enum Fallback {
  OfflineJson,
  OfflinePage,
}

/// Strategy router. Never fails: every path ends in a well-formed response.
pub struct StrategyRouter<S: CacheStorage> {
  registry: PartitionRegistry<S>,
  fetcher: Arc<dyn Fetcher>,
  classifier: Classifier,
  queue: SyncQueue,
  offline_page: Url,
  /// Cache writes in progress; the request path never awaits them
  pending_writes: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: CacheStorage + 'static> StrategyRouter<S> {
  pub fn new(
    registry: PartitionRegistry<S>,
    fetcher: Arc<dyn Fetcher>,
    classifier: Classifier,
    queue: SyncQueue,
    offline_page: Url,
  ) -> Self {
    Self {
      registry,
      fetcher,
      classifier,
      queue,
      offline_page,
      pending_writes: Mutex::new(Vec::new()),
    }
  }

  /// Intercept one request and answer it.
  pub async fn handle(&self, request: Request) -> Served {
    let class = self.classifier.classify(&request);
    debug!(method = %request.method, url = %request.url, class = ?class, "Intercepted request");

    let answer = match class {
      RequestClass::Bypass(BypassReason::Mutation) => self.pass_mutation(request).await,
      RequestClass::Bypass(BypassReason::CrossOrigin) => self.pass_through(request).await,
      RequestClass::Api => {
        self
          .network_first(request, PartitionRole::Api, Fallback::OfflineJson)
          .await
      }
      RequestClass::Navigation => {
        self
          .network_first(request, PartitionRole::Runtime, Fallback::OfflinePage)
          .await
      }
      RequestClass::Asset => self.cache_first(request).await,
    };

    Served {
      response: answer.response,
      source: answer.source,
      class,
      captured_at: answer.captured_at,
    }
  }

  /// Wait for cache writes dispatched so far.
  pub async fn settle(&self) {
    let handles = match self.pending_writes.lock() {
      Ok(mut pending) => std::mem::take(&mut *pending),
      Err(e) => {
        error!(error = %e, "Pending write list poisoned");
        return;
      }
    };
    for handle in handles {
      if let Err(e) = handle.await {
        warn!(error = %e, "Cache write task failed");
      }
    }
  }

  /// Network first; on failure the cached copy, then `fallback`.
  ///
  /// The current partition for `role` is consulted before older generations.
  async fn network_first(
    &self,
    request: Request,
    role: PartitionRole,
    fallback: Fallback,
  ) -> Answer {
    let key = CacheKey::for_url(&request.url);
    let url = request.url.clone();

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.cache_in_background(role, key, response.clone());
        }
        Answer::new(response, ResponseSource::Network)
      }
      Err(e) => {
        warn!(url = %url, error = %e, "Network failed, falling back to cache");
        let cached = self
          .registry
          .match_in(role, &key)
          .or_else(|| self.registry.match_key(&key));
        if let Some(entry) = cached {
          return Answer::cached(entry, ResponseSource::Cache);
        }
        match fallback {
          Fallback::OfflineJson => Answer::new(Response::offline(), ResponseSource::Offline),
          Fallback::OfflinePage => self.offline_page(),
        }
      }
    }
  }

  /// Cache first; the network is only consulted on a miss.
  async fn cache_first(&self, request: Request) -> Answer {
    let key = CacheKey::for_url(&request.url);
    if let Some(entry) = self.registry.match_key(&key) {
      debug!(key = %key, "Cache hit");
      return Answer::cached(entry, ResponseSource::Cache);
    }

    let url = request.url.clone();
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.cache_in_background(PartitionRole::Static, key, response.clone());
        }
        Answer::new(response, ResponseSource::Network)
      }
      Err(e) => {
        warn!(url = %url, error = %e, "Asset unavailable offline");
        Answer::new(Response::unavailable(), ResponseSource::Offline)
      }
    }
  }

  /// Uncached pass-through for cross-origin requests.
  async fn pass_through(&self, request: Request) -> Answer {
    let url = request.url.clone();
    match self.fetcher.fetch(request).await {
      Ok(response) => Answer::new(response, ResponseSource::Network),
      Err(e) => {
        warn!(url = %url, error = %e, "Cross-origin request failed");
        Answer::new(Response::offline(), ResponseSource::Offline)
      }
    }
  }

  /// Uncached pass-through for mutations; recognized failures are deferred.
  async fn pass_mutation(&self, request: Request) -> Answer {
    let family = self.classifier.mutation_family(&request);
    let mut stored = StoredRequest::from_request(&request);
    if let Some(refresh) = self.classifier.refresh_url(&request) {
      stored = stored.with_refresh(&refresh);
    }
    let url = request.url.clone();

    let error = match self.fetcher.fetch(request).await {
      Ok(response) => return Answer::new(response, ResponseSource::Network),
      Err(e) => e,
    };

    let Some(family) = family else {
      warn!(url = %url, error = %error, "Mutation failed and has no sync family");
      return Answer::new(Response::offline(), ResponseSource::Offline);
    };

    match self.queue.enqueue(family, TaskPayload::Request(stored)) {
      Ok(_) => Answer::new(Response::queued(), ResponseSource::Queued),
      Err(e) => {
        error!(url = %url, error = %e, "Failed to defer mutation");
        Answer::new(Response::offline(), ResponseSource::Offline)
      }
    }
  }

  /// Cached offline page, or the built-in placeholder.
  fn offline_page(&self) -> Answer {
    match self.registry.match_key(&CacheKey::for_url(&self.offline_page)) {
      Some(entry) => Answer::cached(entry, ResponseSource::OfflinePage),
      None => Answer::new(Response::offline_page(), ResponseSource::OfflinePage),
    }
  }

  /// Write an independent copy of `response` without holding up the caller.
  fn cache_in_background(&self, role: PartitionRole, key: CacheKey, response: Response) {
    let registry = self.registry.clone();
    let handle = tokio::spawn(async move {
      let partition = registry.open_role(role);
      registry.put(&partition, &key, &response);
    });

    match self.pending_writes.lock() {
      Ok(mut pending) => {
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
      }
      // The write still runs, it just cannot be awaited by `settle`.
      Err(e) => error!(error = %e, "Pending write list poisoned"),
    }
  }
}
