//! Events delivered by the host and the outcomes the engine hands back.

use bytes::Bytes;
use serde_json::Value;

use crate::http::Request;
use crate::notify::{ClickOutcome, NotificationIntent};
use crate::router::Served;
use crate::sync::SyncReport;

/// Host events, one variant per handler in the dispatch table.
#[derive(Debug, Clone)]
pub enum Event {
  /// A new generation is being installed
  Install,
  /// The installed generation takes over
  Activate,
  /// An outbound request was intercepted
  Fetch(Request),
  /// Reconnect / background-sync signal with its tag, e.g. `sync-listings`
  Sync(String),
  /// Push message with its raw payload, if any
  Push(Option<Bytes>),
  /// The user activated a notification
  NotificationClick(NotificationIntent),
  /// Control message posted by the application
  Message(ControlMessage),
}

/// Control messages the application may post to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
  /// Adopt the waiting generation now
  SkipWaiting,
  Other(String),
}

impl ControlMessage {
  /// Accepts `{"type":"SKIP_WAITING"}` or a bare `SKIP_WAITING`.
  pub fn parse(raw: &str) -> Self {
    let kind = match serde_json::from_str::<Value>(raw) {
      Ok(value) => value
        .get("type")
        .and_then(Value::as_str)
        .or_else(|| value.as_str())
        .map(String::from)
        .unwrap_or_else(|| raw.trim().to_string()),
      Err(_) => raw.trim().to_string(),
    };
    match kind.as_str() {
      "SKIP_WAITING" => Self::SkipWaiting,
      _ => Self::Other(kind),
    }
  }
}

/// Result of precaching the install manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
  /// URLs stored in the static partition
  pub cached: Vec<String>,
  /// URLs that failed; installation continued without them
  pub failed: Vec<String>,
}

/// Result of the activation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
  /// Stale partitions deleted
  pub removed: Vec<String>,
  /// Whether the host accepted the client takeover
  pub claimed: bool,
}

/// What handling an event produced.
#[derive(Debug, Clone)]
pub enum Outcome {
  Installed(InstallReport),
  Activated(ActivateReport),
  Response(Served),
  Synced(SyncReport),
  Notified(NotificationIntent),
  Routed(ClickOutcome),
  Adopted,
  Ignored,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_control_message() {
    assert_eq!(
      ControlMessage::parse(r#"{"type":"SKIP_WAITING"}"#),
      ControlMessage::SkipWaiting
    );
    assert_eq!(ControlMessage::parse("SKIP_WAITING\n"), ControlMessage::SkipWaiting);
    assert_eq!(
      ControlMessage::parse(r#"{"type":"CLEAR_CACHE"}"#),
      ControlMessage::Other("CLEAR_CACHE".to_string())
    );
  }
}
