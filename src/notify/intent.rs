//! Notification intents parsed from push payloads.

use serde_json::Value;

use crate::config::NotificationConfig;

/// Vibration pattern used for every notification, in milliseconds.
const VIBRATE_PATTERN: [u32; 3] = [100, 50, 100];

/// A push-originated alert and its routing target. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationIntent {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  /// De-duplication tag; a new notification replaces one with the same tag
  pub tag: String,
  pub require_interaction: bool,
  pub vibrate: Vec<u32>,
  /// Routing target opened or focused on activation
  pub url: String,
  /// The payload's `data` object, passed through untouched
  pub data: Value,
}

impl NotificationIntent {
  /// Parse a push payload defensively.
  ///
  /// Missing, mistyped or empty fields fall back to `defaults`. A payload
  /// that is not JSON is shown as the notification body. No payload at all
  /// yields a default notification.
  pub fn from_payload(payload: Option<&[u8]>, defaults: &NotificationConfig) -> Self {
    let mut intent = Self::defaults(defaults);
    let Some(raw) = payload else {
      return intent;
    };

    let value = match serde_json::from_slice::<Value>(raw) {
      Ok(Value::Object(map)) => Value::Object(map),
      _ => {
        let text = String::from_utf8_lossy(raw).trim().to_string();
        intent.body = text;
        return intent;
      }
    };

    if let Some(title) = non_empty_str(&value, "title") {
      intent.title = title.to_string();
    }
    if let Some(body) = value.get("body").and_then(Value::as_str) {
      intent.body = body.to_string();
    }
    if let Some(icon) = non_empty_str(&value, "icon") {
      intent.icon = icon.to_string();
    }
    if let Some(tag) = non_empty_str(&value, "tag") {
      intent.tag = tag.to_string();
    }
    if let Some(require) = value.get("requireInteraction").and_then(Value::as_bool) {
      intent.require_interaction = require;
    }
    if let Some(data) = value.get("data").filter(|d| d.is_object()) {
      if let Some(url) = non_empty_str(data, "url") {
        intent.url = url.to_string();
      }
      intent.data = data.clone();
    }

    intent
  }

  fn defaults(defaults: &NotificationConfig) -> Self {
    Self {
      title: defaults.default_title.clone(),
      body: String::new(),
      icon: defaults.default_icon.clone(),
      badge: defaults.badge.clone(),
      tag: defaults.default_tag.clone(),
      require_interaction: false,
      vibrate: VIBRATE_PATTERN.to_vec(),
      url: defaults.default_url.clone(),
      data: Value::Null,
    }
  }
}

fn non_empty_str<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
  value
    .get(field)
    .and_then(Value::as_str)
    .filter(|s| !s.trim().is_empty())
}
