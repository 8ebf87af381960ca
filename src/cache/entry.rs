//! Keys, entries and partition descriptors held by the registry.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use crate::http::Response;

/// Normalized request descriptor: `GET <absolute-url>` with the fragment removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
  pub fn for_url(url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self(format!("GET {}", url))
  }

  /// Rebuild a key previously produced by [`CacheKey::as_str`].
  pub fn from_stored(raw: String) -> Self {
    Self(raw)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// SHA256 hash for stable, fixed-length storage keys.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.0.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// A complete response snapshot stored under a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
  pub key: CacheKey,
  pub response: Response,
  pub captured_at: DateTime<Utc>,
}

impl CachedEntry {
  pub fn capture(key: CacheKey, response: Response) -> Self {
    Self {
      key,
      response,
      captured_at: Utc::now(),
    }
  }
}

/// Semantic role of a partition. Each role has exactly one current partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionRole {
  /// Precached and cache-first static assets
  Static,
  /// Pages captured from navigations
  Runtime,
  /// API responses
  Api,
}

impl PartitionRole {
  pub const ALL: [PartitionRole; 3] = [Self::Static, Self::Runtime, Self::Api];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Runtime => "runtime",
      Self::Api => "api",
    }
  }

  /// Partition name for this role: `<prefix>-<role>-<version>`.
  pub fn partition_name(&self, prefix: &str, version: &str) -> String {
    format!("{}-{}-{}", prefix, self.as_str(), version)
  }
}

/// Descriptor of a named partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
  pub name: String,
  pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_key_strips_fragment() {
    let a = Url::parse("http://localhost:3000/static/app.js#v1").unwrap();
    let b = Url::parse("http://localhost:3000/static/app.js").unwrap();
    assert_eq!(CacheKey::for_url(&a), CacheKey::for_url(&b));
    assert_eq!(
      CacheKey::for_url(&b).as_str(),
      "GET http://localhost:3000/static/app.js"
    );
  }

  #[test]
  fn test_digest_is_stable() {
    let url = Url::parse("http://localhost:3000/").unwrap();
    let key = CacheKey::for_url(&url);
    assert_eq!(key.digest(), CacheKey::for_url(&url).digest());
    assert_eq!(key.digest().len(), 64);
  }

  #[test]
  fn test_partition_names() {
    assert_eq!(
      PartitionRole::Api.partition_name("marketplace", "v2"),
      "marketplace-api-v2"
    );
  }
}
