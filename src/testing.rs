//! Test doubles for the network and the host environment.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use url::Url;

use crate::host::{Host, WindowClient};
use crate::http::{Request, Response};
use crate::net::Fetcher;
use crate::notify::NotificationIntent;

/// Scripted fetcher that records every call.
///
/// Unrouted URLs answer 404. While offline, or for URLs marked unreachable,
/// every call fails like a dropped connection.
#[derive(Default)]
pub struct MockFetcher {
  routes: Mutex<HashMap<String, Response>>,
  unreachable: Mutex<HashSet<String>>,
  calls: Mutex<Vec<String>>,
  offline: AtomicBool,
}

impl MockFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn route(&self, url: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn unreachable(&self, url: &str) {
    self.unreachable.lock().unwrap().insert(url.to_string());
  }

  pub fn reachable(&self, url: &str) {
    self.unreachable.lock().unwrap().remove(url);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  /// Calls made so far, as `METHOD url`.
  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

impl Fetcher for MockFetcher {
  fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response>> {
    Box::pin(async move {
      let url = request.url.to_string();
      self
        .calls
        .lock()
        .unwrap()
        .push(format!("{} {}", request.method, url));

      // Suspend once so concurrent callers interleave as on a real network.
      tokio::task::yield_now().await;

      if self.offline.load(Ordering::SeqCst) || self.unreachable.lock().unwrap().contains(&url) {
        return Err(eyre!("network unreachable: {}", url));
      }

      Ok(
        self
          .routes
          .lock()
          .unwrap()
          .get(&url)
          .cloned()
          .unwrap_or_else(|| Response::new(404, "not found")),
      )
    })
  }
}

/// Host stub that records every side effect.
#[derive(Default)]
pub struct RecordingHost {
  shown: Mutex<Vec<NotificationIntent>>,
  closed: Mutex<Vec<String>>,
  windows: Mutex<Vec<WindowClient>>,
  opened: Mutex<Vec<String>>,
  focused: Mutex<Vec<String>>,
  claims: Mutex<usize>,
  skips: Mutex<usize>,
  display_fails: AtomicBool,
}

impl RecordingHost {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_window(&self, id: &str, url: &str) {
    self.push_window(id, url, false);
  }

  pub fn add_focused_window(&self, id: &str, url: &str) {
    self.push_window(id, url, true);
  }

  fn push_window(&self, id: &str, url: &str, focused: bool) {
    let mut windows = self.windows.lock().unwrap();
    if focused {
      windows.iter_mut().for_each(|w| w.focused = false);
    }
    windows.push(WindowClient {
      id: id.to_string(),
      url: url.to_string(),
      focused,
    });
  }

  pub fn fail_display(&self) {
    self.display_fails.store(true, Ordering::SeqCst);
  }

  pub fn shown(&self) -> Vec<NotificationIntent> {
    self.shown.lock().unwrap().clone()
  }

  pub fn closed(&self) -> Vec<String> {
    self.closed.lock().unwrap().clone()
  }

  pub fn opened(&self) -> Vec<String> {
    self.opened.lock().unwrap().clone()
  }

  pub fn focused(&self) -> Vec<String> {
    self.focused.lock().unwrap().clone()
  }

  pub fn claims(&self) -> usize {
    *self.claims.lock().unwrap()
  }

  pub fn skips(&self) -> usize {
    *self.skips.lock().unwrap()
  }
}

impl Host for RecordingHost {
  fn show_notification(&self, intent: &NotificationIntent) -> Result<()> {
    if self.display_fails.load(Ordering::SeqCst) {
      return Err(eyre!("notification permission denied"));
    }
    self.shown.lock().unwrap().push(intent.clone());
    Ok(())
  }

  fn close_notification(&self, tag: &str) {
    self.closed.lock().unwrap().push(tag.to_string());
  }

  fn windows(&self) -> BoxFuture<'_, Result<Vec<WindowClient>>> {
    Box::pin(async move { Ok(self.windows.lock().unwrap().clone()) })
  }

  fn focus_window(&self, id: &str) -> BoxFuture<'_, Result<()>> {
    let id = id.to_string();
    Box::pin(async move {
      for window in self.windows.lock().unwrap().iter_mut() {
        window.focused = window.id == id;
      }
      self.focused.lock().unwrap().push(id);
      Ok(())
    })
  }

  fn open_window(&self, url: &Url) -> BoxFuture<'_, Result<WindowClient>> {
    let url = url.to_string();
    Box::pin(async move {
      let mut windows = self.windows.lock().unwrap();
      windows.iter_mut().for_each(|w| w.focused = false);
      let window = WindowClient {
        id: format!("opened-{}", windows.len() + 1),
        url: url.clone(),
        focused: true,
      };
      windows.push(window.clone());
      self.opened.lock().unwrap().push(url);
      Ok(window)
    })
  }

  fn claim_clients(&self) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
      *self.claims.lock().unwrap() += 1;
      Ok(())
    })
  }

  fn skip_waiting(&self) {
    *self.skips.lock().unwrap() += 1;
  }
}
