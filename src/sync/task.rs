//! Sync task model: families, delivery states and payloads.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::http::{Headers, Request};

/// Family of deferred work, selected by the reconnect signal's tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncFamily {
  Listings,
  Chat,
  Transactions,
}

impl SyncFamily {
  pub const ALL: [SyncFamily; 3] = [Self::Listings, Self::Chat, Self::Transactions];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Listings => "listings",
      Self::Chat => "chat",
      Self::Transactions => "transactions",
    }
  }

  /// Signal tag delivered by the host, e.g. `sync-listings`.
  pub fn tag(&self) -> String {
    format!("sync-{}", self.as_str())
  }

  /// Parse a signal tag. Accepts `sync-listings` as well as bare `listings`.
  pub fn from_tag(tag: &str) -> Option<Self> {
    let name = tag.strip_prefix("sync-").unwrap_or(tag);
    Self::ALL.into_iter().find(|family| family.as_str() == name)
  }

  pub(crate) fn index(&self) -> usize {
    match self {
      Self::Listings => 0,
      Self::Chat => 1,
      Self::Transactions => 2,
    }
  }
}

impl fmt::Display for SyncFamily {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Delivery state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
  /// Waiting for the next reconnect signal
  Pending,
  /// Replay currently executing
  InFlight,
  /// Replay confirmed; the task is removed right after
  Done,
  /// Not written by replay; a row found in this state returns to pending on the next signal
  Failed,
}

impl TaskState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::InFlight => "in-flight",
      Self::Done => "done",
      Self::Failed => "failed",
    }
  }

  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "pending" => Ok(Self::Pending),
      "in-flight" => Ok(Self::InFlight),
      "done" => Ok(Self::Done),
      "failed" => Ok(Self::Failed),
      other => Err(eyre!("Unknown task state '{}'", other)),
    }
  }
}

impl fmt::Display for TaskState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A mutating request captured for later replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRequest {
  pub method: String,
  pub url: String,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
  /// Resource to re-read into the cache after a successful replay
  #[serde(default)]
  pub refresh_url: Option<String>,
}

impl StoredRequest {
  pub fn from_request(request: &Request) -> Self {
    Self {
      method: request.method.clone(),
      url: request.url.to_string(),
      headers: request.headers.clone(),
      body: request.body.as_ref().map(|b| b.to_vec()),
      refresh_url: None,
    }
  }

  pub fn with_refresh(mut self, url: &Url) -> Self {
    self.refresh_url = Some(url.to_string());
    self
  }

  pub fn to_request(&self) -> Result<Request> {
    let url =
      Url::parse(&self.url).map_err(|e| eyre!("Invalid stored URL '{}': {}", self.url, e))?;
    Ok(Request {
      method: self.method.clone(),
      url,
      headers: self.headers.clone(),
      body: self.body.clone().map(Bytes::from),
    })
  }
}

/// What a task replays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TaskPayload {
  /// A captured HTTP request, replayed verbatim
  Request(StoredRequest),
  /// Host-supplied data for a family without a replay contract
  Opaque { data: serde_json::Value },
}

/// One deferred mutating operation.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncTask {
  pub id: i64,
  pub family: SyncFamily,
  pub payload: TaskPayload,
  pub enqueued_at: DateTime<Utc>,
  pub state: TaskState,
  pub attempts: u32,
  pub last_error: Option<String>,
}

impl SyncTask {
  /// Short description for logs and listings.
  pub fn describe(&self) -> String {
    match &self.payload {
      TaskPayload::Request(request) => format!("{} {}", request.method, request.url),
      TaskPayload::Opaque { .. } => "opaque payload".to_string(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_family_tags() {
    assert_eq!(SyncFamily::from_tag("sync-listings"), Some(SyncFamily::Listings));
    assert_eq!(SyncFamily::from_tag("chat"), Some(SyncFamily::Chat));
    assert_eq!(
      SyncFamily::from_tag(&SyncFamily::Transactions.tag()),
      Some(SyncFamily::Transactions)
    );
    assert_eq!(SyncFamily::from_tag("sync-rewards"), None);
  }

  #[test]
  fn test_state_parse() {
    for state in [
      TaskState::Pending,
      TaskState::InFlight,
      TaskState::Done,
      TaskState::Failed,
    ] {
      assert_eq!(TaskState::parse(state.as_str()).unwrap(), state);
    }
    assert!(TaskState::parse("lost").is_err());
  }

  #[test]
  fn test_stored_request_keeps_body() {
    let url = Url::parse("http://localhost:3000/api/listings").unwrap();
    let request = Request::new("POST", url)
      .with_header("Content-Type", "application/json")
      .with_body(r#"{"title":"Bike"}"#);

    let stored = StoredRequest::from_request(&request);
    let json = serde_json::to_string(&TaskPayload::Request(stored.clone())).unwrap();
    assert!(json.contains(r#""kind":"request""#));

    let replay = stored.to_request().unwrap();
    assert_eq!(replay.method, "POST");
    assert_eq!(replay.body, request.body);
    assert_eq!(replay.headers.get("content-type"), Some("application/json"));
  }
}
