//! Capabilities the host environment provides to the engine.
//!
//! Notification display, window routing and client takeover are side effects
//! the engine requests but does not own. They sit behind [`Host`] so tests can
//! substitute a recording stub and the CLI can print instead of render.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::info;
use url::Url;

use crate::notify::NotificationIntent;

/// An application window the host knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowClient {
  pub id: String,
  pub url: String,
  pub focused: bool,
}

pub trait Host: Send + Sync {
  /// Display a notification. Fire-and-forget; failures are not retried.
  fn show_notification(&self, intent: &NotificationIntent) -> Result<()>;

  /// Dismiss the notification with `tag`.
  fn close_notification(&self, tag: &str);

  /// Windows currently controlled by the engine.
  fn windows(&self) -> BoxFuture<'_, Result<Vec<WindowClient>>>;

  fn focus_window(&self, id: &str) -> BoxFuture<'_, Result<()>>;

  fn open_window(&self, url: &Url) -> BoxFuture<'_, Result<WindowClient>>;

  /// Take control of all existing clients immediately.
  fn claim_clients(&self) -> BoxFuture<'_, Result<()>>;

  /// Activate the newly installed generation without waiting for old clients to close.
  fn skip_waiting(&self);
}

/// Host used by the command line: prints notifications and tracks windows it "opens".
#[derive(Default)]
pub struct ConsoleHost {
  windows: Mutex<Vec<WindowClient>>,
  next_id: AtomicU64,
}

impl ConsoleHost {
  pub fn new() -> Self {
    Self::default()
  }
}

impl Host for ConsoleHost {
  fn show_notification(&self, intent: &NotificationIntent) -> Result<()> {
    println!("[{}] {}", intent.tag, intent.title);
    if !intent.body.is_empty() {
      println!("  {}", intent.body);
    }
    println!("  -> {}", intent.url);
    Ok(())
  }

  fn close_notification(&self, tag: &str) {
    info!(tag = %tag, "Notification closed");
  }

  fn windows(&self) -> BoxFuture<'_, Result<Vec<WindowClient>>> {
    Box::pin(async move {
      let windows = self
        .windows
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      Ok(windows.clone())
    })
  }

  fn focus_window(&self, id: &str) -> BoxFuture<'_, Result<()>> {
    let id = id.to_string();
    Box::pin(async move {
      println!("focus window {}", id);
      Ok(())
    })
  }

  fn open_window(&self, url: &Url) -> BoxFuture<'_, Result<WindowClient>> {
    let url = url.to_string();
    Box::pin(async move {
      let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
      let window = WindowClient {
        id: format!("window-{}", id),
        url,
        focused: true,
      };
      println!("open window {}", window.url);
      let mut windows = self
        .windows
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      windows.push(window.clone());
      Ok(window)
    })
  }

  fn claim_clients(&self) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
      info!("Claimed all clients");
      Ok(())
    })
  }

  fn skip_waiting(&self) {
    info!("Skipping waiting phase");
  }
}
