//! Request and response snapshots that flow through the engine.
//!
//! Bodies are held as `Bytes`, so cloning a response hands out an independent
//! handle to the same immutable buffer. Caching a response never consumes the
//! copy returned to the caller.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use url::Url;

/// Body returned for API requests when neither network nor cache can answer.
pub const OFFLINE_BODY: &str = r#"{"offline":true,"message":"You are offline"}"#;

/// Body returned when a mutating request was deferred to the sync queue.
pub const QUEUED_BODY: &str = r#"{"offline":true,"queued":true,"message":"You are offline. Your change will be synced when you reconnect."}"#;

/// Minimal page served to navigations when the offline page itself is not cached.
const OFFLINE_HTML: &str = "<!DOCTYPE html><html><head><title>Offline</title></head>\
<body><h1>You are offline</h1><p>Check your connection and try again.</p></body></html>";

/// Ordered, case-insensitive header list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
  pub fn new() -> Self {
    Self::default()
  }

  /// Look up the first value for `name`, ignoring ASCII case.
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .0
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Replace any existing values for `name` with `value`.
  pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
    self.0.push((name, value.into()));
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
  }
}

impl FromIterator<(String, String)> for Headers {
  fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
    Self(iter.into_iter().collect())
  }
}

/// An outbound request observed before it reaches the network.
#[derive(Debug, Clone)]
pub struct Request {
  /// Upper-case HTTP method
  pub method: String,
  pub url: Url,
  pub headers: Headers,
  pub body: Option<Bytes>,
}

impl Request {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
      headers: Headers::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name, value);
    self
  }

  pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  /// True when the `Accept` header asks for an HTML document.
  pub fn accepts_html(&self) -> bool {
    self
      .headers
      .get("accept")
      .map(|accept| accept.contains("text/html"))
      .unwrap_or(false)
  }
}

/// An immutable response snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Headers,
  pub body: Bytes,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers: Headers::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name, value);
    self
  }

  /// Only 2xx responses are eligible for caching.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Synthesized 503 for API requests that cannot be served.
  pub fn offline() -> Self {
    Self::new(503, OFFLINE_BODY).with_header("content-type", "application/json")
  }

  /// Synthesized 503 for a mutation that was accepted into the sync queue.
  pub fn queued() -> Self {
    Self::new(503, QUEUED_BODY).with_header("content-type", "application/json")
  }

  /// Built-in placeholder used when the offline page is missing from cache.
  pub fn offline_page() -> Self {
    Self::new(503, OFFLINE_HTML).with_header("content-type", "text/html; charset=utf-8")
  }

  /// Empty 503 for static assets that are neither cached nor reachable.
  pub fn unavailable() -> Self {
    Self::new(503, Bytes::new())
  }

  pub fn text(&self) -> Cow<'_, str> {
    String::from_utf8_lossy(&self.body)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_headers_are_case_insensitive() {
    let mut headers = Headers::new();
    headers.insert("Content-Type", "text/plain");
    headers.insert("content-type", "application/json");

    assert_eq!(headers.iter().count(), 1);
    assert_eq!(headers.get("CONTENT-TYPE"), Some("application/json"));
  }

  #[test]
  fn test_request_method_is_normalized() {
    let url = Url::parse("http://localhost:3000/api/listings").unwrap();
    let request = Request::new("post", url);
    assert_eq!(request.method, "POST");
    assert!(!request.is_get());
  }

  #[test]
  fn test_accepts_html() {
    let url = Url::parse("http://localhost:3000/listings/1").unwrap();
    let page = Request::get(url.clone()).with_header("Accept", "text/html,application/xhtml+xml");
    let api = Request::get(url).with_header("Accept", "application/json");

    assert!(page.accepts_html());
    assert!(!api.accepts_html());
  }

  #[test]
  fn test_offline_body_shape() {
    let response = Response::offline();
    assert_eq!(response.status, 503);
    assert_eq!(
      response.text(),
      r#"{"offline":true,"message":"You are offline"}"#
    );

    let parsed: serde_json::Value = serde_json::from_slice(&Response::queued().body).unwrap();
    assert_eq!(parsed["queued"], serde_json::json!(true));
  }

  #[test]
  fn test_success_range() {
    assert!(Response::new(200, "ok").is_success());
    assert!(Response::new(204, "").is_success());
    assert!(!Response::new(301, "").is_success());
    assert!(!Response::new(404, "").is_success());
  }
}
