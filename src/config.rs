use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use url::Url;

use crate::sync::SyncFamily;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Application origin; requests to any other origin bypass the cache
  pub origin: String,
  pub cache: CacheConfig,
  pub routes: RoutesConfig,
  pub network: NetworkConfig,
  pub notifications: NotificationConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000".to_string(),
      cache: CacheConfig::default(),
      routes: RoutesConfig::default(),
      network: NetworkConfig::default(),
      notifications: NotificationConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Prefix shared by all partition names
  pub prefix: String,
  /// Deployment generation; derived from the precache manifest when unset
  pub version: Option<String>,
  /// SQLite cache database (defaults to the data directory)
  pub database: Option<PathBuf>,
  /// SQLite sync queue database (defaults to the data directory)
  pub queue_database: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "marketplace".to_string(),
      version: None,
      database: None,
      queue_database: None,
    }
  }
}

/// Maps a mutating API path prefix to the sync family that replays it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MutationRoute {
  pub prefix: String,
  pub family: SyncFamily,
}

impl MutationRoute {
  fn new(prefix: &str, family: SyncFamily) -> Self {
    Self {
      prefix: prefix.to_string(),
      family,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  /// Same-origin path prefix that marks API resources
  pub api_prefix: String,
  /// Placeholder page served to navigations when offline
  pub offline_page: String,
  /// Static URLs pre-populated into the static partition on install
  pub precache: Vec<String>,
  pub mutations: Vec<MutationRoute>,
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      api_prefix: "/api/".to_string(),
      offline_page: "/offline.html".to_string(),
      precache: vec![
        "/".to_string(),
        "/offline.html".to_string(),
        "/manifest.json".to_string(),
        "/icons/icon-192x192.png".to_string(),
        "/icons/icon-512x512.png".to_string(),
      ],
      mutations: vec![
        MutationRoute::new("/api/listings", SyncFamily::Listings),
        MutationRoute::new("/api/chat", SyncFamily::Chat),
        MutationRoute::new("/api/messages", SyncFamily::Chat),
        MutationRoute::new("/api/transactions", SyncFamily::Transactions),
      ],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Per-request timeout; a timeout counts as a network failure
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 10 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub default_title: String,
  pub default_icon: String,
  pub badge: String,
  pub default_tag: String,
  pub default_url: String,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      default_title: "Marketplace".to_string(),
      default_icon: "/icons/icon-192x192.png".to_string(),
      badge: "/icons/icon-72x72.png".to_string(),
      default_tag: "marketplace-notification".to_string(),
      default_url: "/".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./marketsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/marketsync/config.yaml
  ///
  /// Falls back to defaults when no file is found. `MARKETSYNC_ORIGIN`
  /// overrides the configured origin.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(origin) = std::env::var("MARKETSYNC_ORIGIN") {
      config.origin = origin;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("marketsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("marketsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Parsed application origin.
  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve a path or URL from the config against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid URL '{}': {}", path, e))
  }

  /// Absolute URLs of the precache manifest.
  pub fn precache_urls(&self) -> Result<Vec<Url>> {
    self
      .routes
      .precache
      .iter()
      .map(|path| self.resolve(path))
      .collect()
  }

  /// Deployment generation used in partition names.
  ///
  /// An explicit version wins; otherwise the first 8 hex chars of a SHA256
  /// over the precache manifest, so a changed manifest yields a new generation.
  pub fn cache_version(&self) -> String {
    if let Some(version) = &self.cache.version {
      return version.clone();
    }

    let mut hasher = Sha256::new();
    for path in &self.routes.precache {
      hasher.update(path.as_bytes());
      hasher.update(b"\n");
    }
    let digest = hex::encode(hasher.finalize());
    format!("v{}", &digest[..8])
  }

  /// Directory for databases and logs.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("marketsync"))
  }

  pub fn cache_database(&self) -> Result<PathBuf> {
    match &self.cache.database {
      Some(path) => Ok(path.clone()),
      None => Ok(Self::data_dir()?.join("cache.db")),
    }
  }

  pub fn queue_database(&self) -> Result<PathBuf> {
    match &self.cache.queue_database {
      Some(path) => Ok(path.clone()),
      None => Ok(Self::data_dir()?.join("queue.db")),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      r#"
origin: "https://shop.example.com"
cache:
  version: "v7"
routes:
  mutations:
    - prefix: /api/offers
      family: listings
"#,
    )
    .unwrap();

    assert_eq!(config.origin, "https://shop.example.com");
    assert_eq!(config.cache_version(), "v7");
    assert_eq!(config.cache.prefix, "marketplace");
    assert_eq!(config.routes.api_prefix, "/api/");
    assert_eq!(
      config.routes.mutations,
      vec![MutationRoute::new("/api/offers", SyncFamily::Listings)]
    );
    assert_eq!(config.network.timeout_secs, 10);
  }

  #[test]
  fn test_version_follows_manifest() {
    let config = Config::default();
    let version = config.cache_version();
    assert_eq!(version.len(), 9);
    assert_eq!(version, Config::default().cache_version());

    let mut changed = Config::default();
    changed.routes.precache.push("/static/app.js".to_string());
    assert_ne!(changed.cache_version(), version);
  }

  #[test]
  fn test_precache_urls_are_absolute() {
    let config = Config::default();
    let urls = config.precache_urls().unwrap();
    assert_eq!(urls[1].as_str(), "http://localhost:3000/offline.html");
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/marketsync.yaml"))).is_err());
  }
}
