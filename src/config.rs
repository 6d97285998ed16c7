use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::RetryConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub store: StoreConfig,
  pub queue: QueueConfig,
  /// Retry policy for network fetches inside the coordinator
  pub retry: RetryConfig,
  /// How many times a single resolution round-trip is attempted
  pub resolve_attempts: ResolveAttempts,
  pub fetch: FetchConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(transparent)]
pub struct ResolveAttempts(pub u32);

impl Default for ResolveAttempts {
  fn default() -> Self {
    Self(2)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  /// Database file (default: $XDG_DATA_HOME/imgcache/images.db)
  pub path: Option<PathBuf>,
  /// How long opening the database may take before the store is considered unavailable
  pub probe_timeout_ms: u64,
  /// Entries older than this are refetched. Unset means entries never expire.
  pub max_age_hours: Option<u64>,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      path: None,
      probe_timeout_ms: 3000,
      max_age_hours: None,
    }
  }
}

impl StoreConfig {
  pub fn db_path(&self) -> PathBuf {
    self
      .path
      .clone()
      .unwrap_or_else(|| data_dir().join("images.db"))
  }

  /// Marker file recording that the database is known to be unavailable.
  pub fn flag_path(&self) -> PathBuf {
    self.db_path().with_extension("unavailable")
  }

  pub fn probe_timeout(&self) -> Duration {
    Duration::from_millis(self.probe_timeout_ms)
  }

  pub fn max_age(&self) -> Option<chrono::Duration> {
    self
      .max_age_hours
      .map(|h| chrono::Duration::hours(h.min(i64::MAX as u64 / 3600) as i64))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Maximum simultaneous dispatches (also the number of coordinator instances)
  pub concurrency: usize,
  /// Scheduling tick interval
  pub tick_interval_ms: u64,
  /// Maximum time an item may wait in the queue, and the dispatch timeout
  pub timeout_ms: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      concurrency: 3,
      tick_interval_ms: 100,
      timeout_ms: 15_000,
    }
  }
}

impl QueueConfig {
  pub fn tick_interval(&self) -> Duration {
    Duration::from_millis(self.tick_interval_ms.max(1))
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
  pub user_agent: String,
  pub request_timeout_ms: u64,
}

impl Default for FetchConfig {
  fn default() -> Self {
    Self {
      user_agent: format!("imgcache/{}", env!("CARGO_PKG_VERSION")),
      request_timeout_ms: 10_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter directive when IMGCACHE_LOG is not set
  pub level: String,
  /// Optional log file; rotated daily
  pub file: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./imgcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/imgcache/config.yaml
  /// 4. Built-in defaults
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("imgcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("imgcache").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;

    if config.queue.concurrency == 0 {
      return Err(eyre!("queue.concurrency must be at least 1"));
    }

    Ok(config)
  }
}

/// Directory holding the image database and the unavailable flag.
///
/// Checks IMGCACHE_DATA_DIR first, then the platform data directory.
pub fn data_dir() -> PathBuf {
  if let Some(dir) = std::env::var_os("IMGCACHE_DATA_DIR") {
    return PathBuf::from(dir);
  }

  dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .unwrap_or_else(std::env::temp_dir)
    .join("imgcache")
}
