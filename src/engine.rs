//! The engine: one dispatch table over the four components.
//!
//! Each event kind maps to exactly one handler. Handlers share no mutable
//! state except the partition registry and the sync queue, both accessed by
//! key through their owning component.

use color_eyre::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheKey, CacheStorage, PartitionRegistry, PartitionRole};
use crate::config::Config;
use crate::event::{ActivateReport, ControlMessage, Event, InstallReport, Outcome};
use crate::host::Host;
use crate::http::Request;
use crate::net::Fetcher;
use crate::notify::NotificationDispatcher;
use crate::router::{Classifier, StrategyRouter};
use crate::sync::{SyncFamily, SyncProcessor, SyncQueue};

/// Lifecycle of one deployment generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
  Parsed,
  Installing,
  /// Installed and waiting to take over
  Installed,
  Activating,
  Activated,
}

pub struct Engine<S: CacheStorage> {
  registry: PartitionRegistry<S>,
  router: StrategyRouter<S>,
  processor: SyncProcessor<S>,
  dispatcher: NotificationDispatcher,
  fetcher: Arc<dyn Fetcher>,
  host: Arc<dyn Host>,
  manifest: Vec<Url>,
  lifecycle: Mutex<Lifecycle>,
  adopt_now: AtomicBool,
}

impl<S: CacheStorage + 'static> Engine<S> {
  /// Build the engine for the current deployment generation.
  ///
  /// The registry, queue, network and host are injected; the engine holds
  /// them until it is dropped.
  pub fn new(
    config: &Config,
    storage: S,
    queue: SyncQueue,
    fetcher: Arc<dyn Fetcher>,
    host: Arc<dyn Host>,
  ) -> Result<Self> {
    let origin = config.origin_url()?;
    let registry = PartitionRegistry::new(storage, &config.cache.prefix, &config.cache_version());

    let classifier = Classifier::new(
      origin.clone(),
      &config.routes.api_prefix,
      config.routes.mutations.clone(),
    );
    let router = StrategyRouter::new(
      registry.clone(),
      fetcher.clone(),
      classifier,
      queue.clone(),
      config.resolve(&config.routes.offline_page)?,
    );
    let processor = SyncProcessor::new(queue, fetcher.clone(), registry.clone());
    let dispatcher =
      NotificationDispatcher::new(host.clone(), config.notifications.clone(), origin);

    Ok(Self {
      registry,
      router,
      processor,
      dispatcher,
      fetcher,
      host,
      manifest: config.precache_urls()?,
      lifecycle: Mutex::new(Lifecycle::Parsed),
      adopt_now: AtomicBool::new(false),
    })
  }

  /// Route an event to its handler.
  pub async fn dispatch(&self, event: Event) -> Outcome {
    match event {
      Event::Install => Outcome::Installed(self.install().await),
      Event::Activate => Outcome::Activated(self.activate().await),
      Event::Fetch(request) => Outcome::Response(self.router.handle(request).await),
      Event::Sync(tag) => match SyncFamily::from_tag(&tag) {
        Some(family) => Outcome::Synced(self.processor.on_sync(family).await),
        None => {
          warn!(tag = %tag, "Ignoring sync signal with unknown tag");
          Outcome::Ignored
        }
      },
      Event::Push(payload) => Outcome::Notified(self.dispatcher.on_push(payload.as_deref())),
      Event::NotificationClick(intent) => {
        Outcome::Routed(self.dispatcher.on_click(&intent).await)
      }
      Event::Message(message) => self.on_message(message),
    }
  }

  pub fn registry(&self) -> &PartitionRegistry<S> {
    &self.registry
  }

  pub fn queue(&self) -> &SyncQueue {
    self.processor.queue()
  }

  pub fn lifecycle(&self) -> Lifecycle {
    self
      .lifecycle
      .lock()
      .map(|state| *state)
      .unwrap_or(Lifecycle::Parsed)
  }

  /// Wait for in-flight cache writes before the engine is dropped.
  pub async fn shutdown(&self) {
    self.router.settle().await;
  }

  fn set_lifecycle(&self, next: Lifecycle) {
    match self.lifecycle.lock() {
      Ok(mut state) => {
        debug!(from = ?*state, to = ?next, "Lifecycle transition");
        *state = next;
      }
      Err(e) => warn!(error = %e, "Lifecycle state poisoned"),
    }
  }

  /// Precache the manifest into the static partition.
  ///
  /// A URL that fails is reported and skipped; installation always completes.
  /// Re-running with the same manifest overwrites the same keys.
  async fn install(&self) -> InstallReport {
    self.set_lifecycle(Lifecycle::Installing);
    let partition = self.registry.open_role(PartitionRole::Static);
    let mut report = InstallReport::default();

    for url in &self.manifest {
      match self.fetcher.fetch(Request::get(url.clone())).await {
        Ok(response) if response.is_success() => {
          if self
            .registry
            .put(&partition, &CacheKey::for_url(url), &response)
          {
            report.cached.push(url.to_string());
          } else {
            report.failed.push(url.to_string());
          }
        }
        Ok(response) => {
          warn!(url = %url, status = response.status, "Precache skipped non-success response");
          report.failed.push(url.to_string());
        }
        Err(e) => {
          warn!(url = %url, error = %e, "Precache failed");
          report.failed.push(url.to_string());
        }
      }
    }

    info!(
      partition = %partition.name,
      cached = report.cached.len(),
      failed = report.failed.len(),
      "Install finished"
    );
    self.set_lifecycle(Lifecycle::Installed);
    if self.adopt_now.load(Ordering::SeqCst) {
      self.host.skip_waiting();
    }
    report
  }

  /// Sweep stale generations, then take over all clients.
  async fn activate(&self) -> ActivateReport {
    self.set_lifecycle(Lifecycle::Activating);
    let removed = self.registry.sweep(&self.registry.current_names());

    let claimed = match self.host.claim_clients().await {
      Ok(()) => true,
      Err(e) => {
        warn!(error = %e, "Failed to claim clients");
        false
      }
    };

    info!(
      version = %self.registry.version(),
      removed = removed.len(),
      "Activated"
    );
    self.set_lifecycle(Lifecycle::Activated);
    ActivateReport { removed, claimed }
  }

  fn on_message(&self, message: ControlMessage) -> Outcome {
    match message {
      ControlMessage::SkipWaiting => {
        self.adopt_now.store(true, Ordering::SeqCst);
        self.host.skip_waiting();
        info!("Adopting new version now");
        Outcome::Adopted
      }
      ControlMessage::Other(kind) => {
        debug!(message = %kind, "Ignoring unknown control message");
        Outcome::Ignored
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::http::Response;
  use crate::notify::ClickOutcome;
  use crate::router::ResponseSource;
  use crate::sync::MemoryQueue;
  use crate::testing::{MockFetcher, RecordingHost};
  use bytes::Bytes;

  struct Fixture {
    engine: Engine<MemoryStorage>,
    fetcher: Arc<MockFetcher>,
    host: Arc<RecordingHost>,
  }

  fn config() -> Config {
    let mut config = Config::default();
    config.cache.version = Some("v2".to_string());
    config
  }

  fn fixture_with(config: &Config) -> Fixture {
    let fetcher = Arc::new(MockFetcher::new());
    let host = Arc::new(RecordingHost::new());
    let engine = Engine::new(
      config,
      MemoryStorage::new(),
      SyncQueue::new(MemoryQueue::new()).unwrap(),
      fetcher.clone(),
      host.clone(),
    )
    .unwrap();
    Fixture {
      engine,
      fetcher,
      host,
    }
  }

  fn route_manifest(config: &Config, fetcher: &MockFetcher) {
    for url in config.precache_urls().unwrap() {
      fetcher.route(url.as_str(), Response::new(200, format!("body of {}", url.path())));
    }
  }

  fn static_keys(engine: &Engine<MemoryStorage>) -> Vec<CacheKey> {
    let partition = engine.registry().open_role(PartitionRole::Static);
    engine.registry().keys(&partition)
  }

  #[tokio::test]
  async fn test_install_is_idempotent() {
    let config = config();
    let f = fixture_with(&config);
    route_manifest(&config, &f.fetcher);

    let Outcome::Installed(first) = f.engine.dispatch(Event::Install).await else {
      panic!("expected install report");
    };
    assert_eq!(first.cached.len(), config.routes.precache.len());
    assert!(first.failed.is_empty());
    let keys = static_keys(&f.engine);

    f.engine.dispatch(Event::Install).await;
    assert_eq!(static_keys(&f.engine), keys);
    assert_eq!(f.engine.lifecycle(), Lifecycle::Installed);
  }

  #[tokio::test]
  async fn test_install_survives_partial_failure() {
    let config = config();
    let f = fixture_with(&config);
    route_manifest(&config, &f.fetcher);
    f.fetcher.unreachable("http://localhost:3000/manifest.json");

    let Outcome::Installed(report) = f.engine.dispatch(Event::Install).await else {
      panic!("expected install report");
    };
    assert_eq!(report.failed, vec!["http://localhost:3000/manifest.json"]);
    assert_eq!(report.cached.len(), config.routes.precache.len() - 1);
    assert_eq!(f.engine.lifecycle(), Lifecycle::Installed);
  }

  #[tokio::test]
  async fn test_activate_sweeps_and_claims() {
    let config = config();
    let f = fixture_with(&config);
    let stale = f.engine.registry().open("marketplace-static-v1");
    f.engine.registry().put(
      &stale,
      &CacheKey::for_url(&Url::parse("http://localhost:3000/old.js").unwrap()),
      &Response::new(200, "old"),
    );
    f.engine.registry().open_role(PartitionRole::Api);

    let Outcome::Activated(report) = f.engine.dispatch(Event::Activate).await else {
      panic!("expected activate report");
    };
    assert_eq!(report.removed, vec!["marketplace-static-v1"]);
    assert!(report.claimed);
    assert_eq!(f.host.claims(), 1);
    assert_eq!(f.engine.lifecycle(), Lifecycle::Activated);

    let names: Vec<String> = f
      .engine
      .registry()
      .partitions()
      .into_iter()
      .map(|p| p.name)
      .collect();
    assert_eq!(names, vec!["marketplace-api-v2"]);
  }

  #[tokio::test]
  async fn test_offline_after_install() {
    let config = config();
    let f = fixture_with(&config);
    route_manifest(&config, &f.fetcher);
    f.engine.dispatch(Event::Install).await;
    f.engine.dispatch(Event::Activate).await;
    f.fetcher.set_offline(true);

    let page = Request::get(Url::parse("http://localhost:3000/listings/3").unwrap())
      .with_header("Accept", "text/html");
    let Outcome::Response(served) = f.engine.dispatch(Event::Fetch(page)).await else {
      panic!("expected a response");
    };
    assert_eq!(served.source, ResponseSource::OfflinePage);
    assert_eq!(served.response.text(), "body of /offline.html");

    let icon = Request::get(Url::parse("http://localhost:3000/icons/icon-192x192.png").unwrap());
    let Outcome::Response(served) = f.engine.dispatch(Event::Fetch(icon)).await else {
      panic!("expected a response");
    };
    assert_eq!(served.source, ResponseSource::Cache);
  }

  #[tokio::test]
  async fn test_queued_mutation_replays_on_sync() {
    let f = fixture_with(&config());
    f.fetcher.set_offline(true);

    let post = Request::new("POST", Url::parse("http://localhost:3000/api/listings").unwrap())
      .with_body(r#"{"title":"Lamp"}"#);
    f.engine.dispatch(Event::Fetch(post)).await;
    assert_eq!(f.engine.queue().tasks().unwrap().len(), 1);

    f.fetcher.set_offline(false);
    f.fetcher
      .route("http://localhost:3000/api/listings", Response::new(201, "{}"));
    let Outcome::Synced(report) = f
      .engine
      .dispatch(Event::Sync("sync-listings".to_string()))
      .await
    else {
      panic!("expected a sync report");
    };
    assert_eq!(report.succeeded.len(), 1);
    assert!(f.engine.queue().tasks().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_unknown_sync_tag_is_ignored() {
    let f = fixture_with(&config());
    let outcome = f.engine.dispatch(Event::Sync("sync-rewards".to_string())).await;
    assert!(matches!(outcome, Outcome::Ignored));
  }

  #[tokio::test]
  async fn test_push_and_click() {
    let f = fixture_with(&config());
    let payload = Bytes::from_static(br#"{"title":"Sale","data":{"url":"/deals"}}"#);

    let Outcome::Notified(intent) = f.engine.dispatch(Event::Push(Some(payload))).await else {
      panic!("expected a notification");
    };
    let outcome = f.engine.dispatch(Event::NotificationClick(intent)).await;

    assert!(matches!(outcome, Outcome::Routed(ClickOutcome::Opened(_))));
    assert_eq!(f.host.opened(), vec!["http://localhost:3000/deals"]);
    assert_eq!(f.fetcher.call_count(), 0);
  }

  #[tokio::test]
  async fn test_skip_waiting_message() {
    let f = fixture_with(&config());
    let outcome = f
      .engine
      .dispatch(Event::Message(ControlMessage::parse(r#"{"type":"SKIP_WAITING"}"#)))
      .await;
    assert!(matches!(outcome, Outcome::Adopted));
    assert!(f.engine.adopt_now.load(Ordering::SeqCst));
    assert_eq!(f.host.skips(), 1);

    let outcome = f
      .engine
      .dispatch(Event::Message(ControlMessage::Other("PING".to_string())))
      .await;
    assert!(matches!(outcome, Outcome::Ignored));
  }
}
