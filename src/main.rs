mod cache;
mod config;
mod engine;
mod event;
mod host;
mod http;
mod net;
mod notify;
mod router;
mod sync;
#[cfg(test)]
mod testing;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use cache::{CacheKey, CacheStorage, MemoryStorage, NoopStorage, SqliteStorage};
use config::Config;
use engine::Engine;
use event::{ControlMessage, Event, Outcome};
use host::ConsoleHost;
use http::Request;
use net::HttpFetcher;
use sync::{MemoryQueue, SqliteQueue, SyncQueue};

#[derive(Parser, Debug)]
#[command(name = "marketsync")]
#[command(about = "Offline cache and background sync engine for a marketplace client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/marketsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Run without a persistent cache
  #[arg(long)]
  no_cache: bool,

  /// Keep the cache and the sync queue in memory for this run only
  #[arg(long, conflicts_with = "no_cache")]
  in_memory: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Intercept one request and print the response
  Fetch {
    url: String,
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Accept header, e.g. text/html for a navigation
    #[arg(short, long)]
    accept: Option<String>,
    #[arg(short, long)]
    body: Option<String>,
  },
  /// Precache the manifest for the current version
  Install,
  /// Remove stale partitions and claim clients
  Activate,
  /// Replay deferred tasks for a sync tag, e.g. sync-listings
  Sync { tag: String },
  /// List deferred tasks
  Queue,
  /// List cache partitions and their entry counts
  Partitions,
  /// Remove a URL from every cache partition
  Evict { url: String },
  /// Deliver a push payload and optionally click the notification
  Push {
    payload: Option<String>,
    #[arg(long)]
    click: bool,
  },
  /// Post a control message, e.g. SKIP_WAITING
  Message { message: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_logging()?;

  if args.in_memory {
    let queue = SyncQueue::new(MemoryQueue::new())?;
    return run(&config, MemoryStorage::new(), queue, args.command).await;
  }

  let queue = SyncQueue::new(SqliteQueue::open(&config.queue_database()?)?)?;
  if args.no_cache {
    run(&config, NoopStorage, queue, args.command).await
  } else {
    let storage = SqliteStorage::open(&config.cache_database()?)?;
    run(&config, storage, queue, args.command).await
  }
}

/// Log to a daily file in the data directory; RUST_LOG overrides the filter.
fn init_logging() -> Result<WorkerGuard> {
  let appender = tracing_appender::rolling::daily(Config::data_dir()?, "marketsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("marketsync=info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

async fn run<S: CacheStorage + 'static>(
  config: &Config,
  storage: S,
  queue: SyncQueue,
  command: Command,
) -> Result<()> {
  let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(config.network.timeout_secs))?);
  let engine = Engine::new(config, storage, queue, fetcher, Arc::new(ConsoleHost::new()))?;

  match command {
    Command::Fetch {
      url,
      method,
      accept,
      body,
    } => {
      let url = config.resolve(&url)?;
      let mut request = Request::new(&method, url);
      if let Some(accept) = accept {
        request = request.with_header("Accept", &accept);
      }
      if let Some(body) = body {
        request = request.with_body(body);
      }
      print_outcome(engine.dispatch(Event::Fetch(request)).await);
    }
    Command::Install => print_outcome(engine.dispatch(Event::Install).await),
    Command::Activate => print_outcome(engine.dispatch(Event::Activate).await),
    Command::Sync { tag } => print_outcome(engine.dispatch(Event::Sync(tag)).await),
    Command::Queue => {
      for task in engine.queue().tasks()? {
        println!(
          "#{} {} [{}] attempts={} enqueued {}  {}",
          task.id,
          task.family.tag(),
          task.state,
          task.attempts,
          task.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
          task.describe()
        );
        if let Some(error) = task.last_error {
          println!("    last error: {}", error);
        }
      }
    }
    Command::Partitions => {
      let registry = engine.registry();
      for partition in registry.partitions() {
        println!(
          "{}  {} entries  created {}",
          partition.name,
          registry.keys(&partition).len(),
          partition.created_at.format("%Y-%m-%d %H:%M:%S")
        );
      }
    }
    Command::Evict { url } => {
      let key = CacheKey::for_url(&config.resolve(&url)?);
      let evicted = engine.registry().evict(&key);
      if evicted.is_empty() {
        println!("{} not cached", key);
      }
      for name in evicted {
        println!("evicted {} from {}", key, name);
      }
    }
    Command::Push { payload, click } => {
      let payload = payload.map(Bytes::from);
      let outcome = engine.dispatch(Event::Push(payload)).await;
      if let (true, Outcome::Notified(intent)) = (click, &outcome) {
        let routed = engine
          .dispatch(Event::NotificationClick(intent.clone()))
          .await;
        print_outcome(routed);
      }
    }
    Command::Message { message } => {
      print_outcome(
        engine
          .dispatch(Event::Message(ControlMessage::parse(&message)))
          .await,
      );
    }
  }

  engine.shutdown().await;
  Ok(())
}

fn print_outcome(outcome: Outcome) {
  match outcome {
    Outcome::Installed(report) => {
      println!("cached {} urls", report.cached.len());
      for url in report.failed {
        println!("failed: {}", url);
      }
    }
    Outcome::Activated(report) => {
      for name in report.removed {
        println!("removed {}", name);
      }
      println!("clients claimed: {}", report.claimed);
    }
    Outcome::Response(served) => {
      println!("{} ({:?}, {:?})", served.response.status, served.source, served.class);
      if let Some(captured_at) = served.captured_at {
        println!("captured {}", captured_at.format("%Y-%m-%d %H:%M:%S"));
      }
      for (name, value) in served.response.headers.iter() {
        println!("{}: {}", name, value);
      }
      println!();
      println!("{}", served.response.text());
    }
    Outcome::Synced(report) => {
      println!(
        "{}: {} attempted, {} succeeded, {} retry, {} skipped",
        report.family,
        report.attempted.len(),
        report.succeeded.len(),
        report.retry.len(),
        report.skipped.len()
      );
    }
    Outcome::Notified(intent) => println!("notified: {}", intent.title),
    Outcome::Routed(outcome) => println!("{:?}", outcome),
    Outcome::Adopted => println!("adopting new version"),
    Outcome::Ignored => println!("ignored"),
  }
}
