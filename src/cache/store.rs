//! Persistent store adapter with degraded-mode fallback.
//!
//! Wraps the durable SQLite backend. When the database cannot be opened within
//! the probe timeout the adapter swaps in [`NoopStorage`] and records the fact
//! in a marker file, so later sessions skip straight to degraded mode until
//! [`ImageStore::sync_status`] finds the database usable again.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::storage::{CacheEntry, ImageStorage, NoopStorage, SqliteStorage};
use crate::config::StoreConfig;

/// Persisted "durable store known unavailable" marker.
#[derive(Debug, Clone)]
pub struct DegradedFlag {
  path: Option<PathBuf>,
}

impl DegradedFlag {
  pub fn at(path: impl Into<PathBuf>) -> Self {
    Self {
      path: Some(path.into()),
    }
  }

  /// A flag that lives only in memory.
  pub fn ephemeral() -> Self {
    Self { path: None }
  }

  pub fn is_set(&self) -> bool {
    self.path.as_deref().is_some_and(Path::exists)
  }

  pub fn set(&self, unavailable: bool) -> Result<()> {
    let Some(path) = &self.path else {
      return Ok(());
    };

    if unavailable {
      if let Some(parent) = path.parent() {
        // Unwritable parent: the flag stays in memory only
        if std::fs::create_dir_all(parent).is_err() {
          warn!("Cannot persist store-unavailable flag at {}", path.display());
          return Ok(());
        }
      }
      std::fs::write(path, Utc::now().to_rfc3339())
        .map_err(|e| eyre!("Failed to write flag {}: {}", path.display(), e))?;
    } else if path.exists() {
      std::fs::remove_file(path)
        .map_err(|e| eyre!("Failed to clear flag {}: {}", path.display(), e))?;
    }
    Ok(())
  }
}

/// Durable image store with transparent fallback to always-miss behaviour.
pub struct ImageStore {
  backend: RwLock<Arc<dyn ImageStorage>>,
  available: AtomicBool,
  db_path: Option<PathBuf>,
  flag: DegradedFlag,
  probe_timeout: Duration,
  max_age: Option<chrono::Duration>,
}

impl ImageStore {
  /// Probe the configured database and build the adapter.
  ///
  /// Never fails: an unusable database yields a degraded store.
  pub async fn init(config: &StoreConfig) -> Self {
    let db_path = config.db_path();
    let flag = DegradedFlag::at(config.flag_path());
    let probe_timeout = config.probe_timeout();

    let backend = if flag.is_set() {
      info!(
        "Image store previously marked unavailable, running degraded (run `sync` to re-check)"
      );
      None
    } else {
      probe(&db_path, probe_timeout).await
    };

    let store = Self {
      backend: RwLock::new(Arc::new(NoopStorage)),
      available: AtomicBool::new(false),
      db_path: Some(db_path),
      flag,
      probe_timeout,
      max_age: config.max_age(),
    };

    match backend {
      Some(storage) => store.attach(Arc::new(storage)),
      None => {
        if let Err(e) = store.flag.set(true) {
          warn!("{}", e);
        }
      }
    }

    store
  }

  /// Build an always-available store over an existing backend.
  pub fn with_backend(backend: Arc<dyn ImageStorage>) -> Self {
    Self {
      backend: RwLock::new(backend),
      available: AtomicBool::new(true),
      db_path: None,
      flag: DegradedFlag::ephemeral(),
      probe_timeout: Duration::from_secs(3),
      max_age: None,
    }
  }

  /// Build a store that is degraded from the start.
  pub fn degraded() -> Self {
    Self {
      backend: RwLock::new(Arc::new(NoopStorage)),
      available: AtomicBool::new(false),
      db_path: None,
      flag: DegradedFlag::ephemeral(),
      probe_timeout: Duration::from_secs(3),
      max_age: None,
    }
  }

  pub fn with_max_age(mut self, max_age: Option<chrono::Duration>) -> Self {
    self.max_age = max_age;
    self
  }

  fn attach(&self, backend: Arc<dyn ImageStorage>) {
    match self.backend.write() {
      Ok(mut slot) => *slot = backend,
      Err(e) => {
        warn!("Store backend lock poisoned: {}", e);
        return;
      }
    }
    self.available.store(true, Ordering::SeqCst);
  }

  fn degrade(&self) -> Result<()> {
    if let Ok(mut slot) = self.backend.write() {
      *slot = Arc::new(NoopStorage);
    }
    self.available.store(false, Ordering::SeqCst);
    warn!("Image store unavailable, caching disabled");
    self.flag.set(true)
  }

  fn backend(&self) -> Arc<dyn ImageStorage> {
    match self.backend.read() {
      Ok(slot) => Arc::clone(&slot),
      Err(_) => Arc::new(NoopStorage),
    }
  }

  /// Whether the durable backend is attached.
  pub fn is_available(&self) -> bool {
    self.available.load(Ordering::SeqCst)
  }

  /// Look up an entry. Entries past the configured max age count as absent.
  pub fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    let backend = self.backend();
    let entry = backend.get(key)?;

    if let (Some(entry), Some(max_age)) = (&entry, self.max_age) {
      if Utc::now() - entry.stored_at > max_age {
        debug!("Entry expired: {}", key);
        if let Err(e) = backend.delete(key) {
          warn!("Failed to drop expired entry {}: {}", key, e);
        }
        return Ok(None);
      }
    }

    Ok(entry)
  }

  pub fn put(&self, key: &str, payload: &[u8]) -> Result<()> {
    self.backend().put(key, payload)
  }

  pub fn delete(&self, key: &str) -> Result<bool> {
    self.backend().delete(key)
  }

  pub fn clear(&self) -> Result<u64> {
    self.backend().clear()
  }

  pub fn count(&self) -> Result<u64> {
    self.backend().count()
  }

  pub fn keys(&self, limit: usize) -> Result<Vec<String>> {
    self.backend().keys(limit)
  }

  pub fn mark_stale(&self, key: &str) -> Result<bool> {
    self.backend().mark_stale(key)
  }

  pub fn total_size(&self) -> Result<u64> {
    self.backend().total_size()
  }

  /// Remove entries older than the configured max age.
  pub fn purge_expired(&self) -> Result<u64> {
    match self.max_age {
      Some(max_age) => self.backend().purge_older_than(Utc::now() - max_age),
      None => Ok(0),
    }
  }

  /// Re-probe the database and correct the degraded flag if it is wrong.
  ///
  /// Returns `true` when a correction was made in either direction.
  pub async fn sync_status(&self) -> Result<bool> {
    let Some(path) = &self.db_path else {
      return Ok(false);
    };

    let flagged_unavailable = !self.is_available() || self.flag.is_set();
    let probed = probe(path, self.probe_timeout).await;

    match (flagged_unavailable, probed) {
      (true, Some(storage)) => {
        self.attach(Arc::new(storage));
        self.flag.set(false)?;
        info!("Image store reachable again, flag corrected");
        Ok(true)
      }
      (false, None) => {
        self.degrade()?;
        info!("Image store no longer reachable, flag corrected");
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  /// Clear the degraded flag, reattach the database and drop every entry.
  ///
  /// Returns whether the durable store is usable afterwards.
  pub async fn reset(&self) -> Result<bool> {
    self.flag.set(false)?;

    if let Some(path) = &self.db_path {
      match probe(path, self.probe_timeout).await {
        Some(storage) => self.attach(Arc::new(storage)),
        None => {
          self.degrade()?;
          return Ok(false);
        }
      }
    }

    let removed = self.clear()?;
    info!("Image store reset, {} entries removed", removed);
    Ok(self.is_available())
  }
}

/// Try to open the database within `timeout`.
async fn probe(path: &Path, timeout: Duration) -> Option<SqliteStorage> {
  let path = path.to_path_buf();
  let open = tokio::task::spawn_blocking(move || SqliteStorage::open(&path));

  match tokio::time::timeout(timeout, open).await {
    Ok(Ok(Ok(storage))) => Some(storage),
    Ok(Ok(Err(e))) => {
      warn!("Image store probe failed: {}", e);
      None
    }
    Ok(Err(e)) => {
      warn!("Image store probe panicked: {}", e);
      None
    }
    Err(_) => {
      warn!("Image store probe timed out after {:?}", timeout);
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config_in(dir: &Path) -> StoreConfig {
    StoreConfig {
      path: Some(dir.join("images.db")),
      ..StoreConfig::default()
    }
  }

  /// A path under a regular file, so the database can never be created.
  fn broken_config(dir: &Path) -> StoreConfig {
    let blocker = dir.join("not-a-dir");
    std::fs::write(&blocker, b"x").unwrap();
    StoreConfig {
      path: Some(blocker.join("images.db")),
      ..StoreConfig::default()
    }
  }

  #[tokio::test]
  async fn test_init_available() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let store = ImageStore::init(&config).await;

    assert!(store.is_available());
    assert!(!config.flag_path().exists());
    store.put("u", b"data").unwrap();
    assert_eq!(store.count().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_init_unavailable_degrades() {
    let dir = tempfile::tempdir().unwrap();
    let store = ImageStore::init(&broken_config(dir.path())).await;

    assert!(!store.is_available());
    store.put("u", b"data").unwrap();
    assert!(store.get("u").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_flag_persists_across_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    DegradedFlag::at(config.flag_path()).set(true).unwrap();

    // Flag short-circuits probing even though the database would open
    let store = ImageStore::init(&config).await;
    assert!(!store.is_available());

    assert!(store.sync_status().await.unwrap());
    assert!(store.is_available());
    assert!(!config.flag_path().exists());

    // Nothing left to correct
    assert!(!store.sync_status().await.unwrap());
  }

  #[tokio::test]
  async fn test_sync_detects_lost_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = ImageStore::init(&config_in(dir.path())).await;
    assert!(store.is_available());

    // Point the adapter at a path that can no longer be opened
    let broken = broken_config(dir.path());
    let store = ImageStore {
      db_path: broken.path.clone(),
      flag: DegradedFlag::at(broken.flag_path()),
      ..store
    };

    assert!(store.sync_status().await.unwrap());
    assert!(!store.is_available());
  }

  #[tokio::test]
  async fn test_expired_entries_are_misses() {
    let backend = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let store =
      ImageStore::with_backend(backend).with_max_age(Some(chrono::Duration::seconds(-1)));

    store.put("u", b"data").unwrap();
    assert!(store.get("u").unwrap().is_none());
    assert_eq!(store.count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_reset_clears_entries_and_flag() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let store = ImageStore::init(&config).await;
    store.put("a", b"1").unwrap();
    store.put("b", b"2").unwrap();

    assert!(store.reset().await.unwrap());
    assert_eq!(store.count().unwrap(), 0);
    assert!(!config.flag_path().exists());
  }
}
