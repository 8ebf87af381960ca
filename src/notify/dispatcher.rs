//! Notification delivery and interaction routing.

use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::intent::NotificationIntent;
use crate::config::NotificationConfig;
use crate::host::Host;

/// Result of routing a notification activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
  /// An existing window already showed the target and was focused
  Focused(String),
  /// A new window was opened on the target
  Opened(String),
  /// The host could neither focus nor open a window
  Unrouted,
}

/// Renders push alerts and routes activations back into the application.
///
/// Independent of the cache: it only reads routing data carried by the
/// notification itself.
pub struct NotificationDispatcher {
  host: Arc<dyn Host>,
  defaults: NotificationConfig,
  origin: Url,
}

impl NotificationDispatcher {
  pub fn new(host: Arc<dyn Host>, defaults: NotificationConfig, origin: Url) -> Self {
    Self {
      host,
      defaults,
      origin,
    }
  }

  /// Delivery flow: parse the payload and ask the host to display it.
  pub fn on_push(&self, payload: Option<&[u8]>) -> NotificationIntent {
    let intent = NotificationIntent::from_payload(payload, &self.defaults);
    match self.host.show_notification(&intent) {
      Ok(()) => debug!(tag = %intent.tag, title = %intent.title, "Displayed notification"),
      Err(e) => warn!(tag = %intent.tag, error = %e, "Failed to display notification"),
    }
    intent
  }

  /// Interaction flow: close the notification, then focus a window already on
  /// the target or open a new one. A matching window that already has focus
  /// is preferred and left as is.
  pub async fn on_click(&self, intent: &NotificationIntent) -> ClickOutcome {
    self.host.close_notification(&intent.tag);

    let target = match self.origin.join(&intent.url) {
      Ok(url) => url,
      Err(e) => {
        warn!(url = %intent.url, error = %e, "Invalid notification URL, routing to origin");
        self.origin.clone()
      }
    };

    let windows = self.host.windows().await.unwrap_or_else(|e| {
      warn!(error = %e, "Failed to list windows");
      Vec::new()
    });

    let matching = windows
      .iter()
      .filter(|w| self.same_target(&w.url, &target))
      .reduce(|best, w| if w.focused && !best.focused { w } else { best });

    if let Some(window) = matching {
      if window.focused {
        debug!(window = %window.id, url = %target, "Target window already focused");
        return ClickOutcome::Focused(window.id.clone());
      }
      match self.host.focus_window(&window.id).await {
        Ok(()) => {
          info!(window = %window.id, url = %target, "Focused existing window");
          return ClickOutcome::Focused(window.id.clone());
        }
        Err(e) => warn!(window = %window.id, error = %e, "Failed to focus window"),
      }
    }

    match self.host.open_window(&target).await {
      Ok(window) => {
        info!(window = %window.id, url = %target, "Opened window");
        ClickOutcome::Opened(window.id)
      }
      Err(e) => {
        warn!(url = %target, error = %e, "Failed to open window");
        ClickOutcome::Unrouted
      }
    }
  }

  /// Windows match when they resolve to the same URL, ignoring fragments.
  fn same_target(&self, window_url: &str, target: &Url) -> bool {
    match self.origin.join(window_url) {
      Ok(mut url) => {
        url.set_fragment(None);
        let mut target = target.clone();
        target.set_fragment(None);
        url == target
      }
      Err(_) => false,
    }
  }
}
