//! Image storage trait and its SQLite and no-op implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// A cached image payload and its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  /// Image URL, unique per entry
  pub key: String,
  pub payload: Vec<u8>,
  pub stored_at: DateTime<Utc>,
  pub size_bytes: u64,
  /// Hex SHA-256 of the payload
  pub sha256: String,
  /// Invalidated entries are kept but must be refetched before use
  pub stale: bool,
}

/// Trait for image storage backends.
///
/// Writes are last-write-wins upserts per key; implementations must accept
/// concurrent callers.
pub trait ImageStorage: Send + Sync {
  /// Get an entry by URL.
  fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

  /// Insert or overwrite an entry. Clears any stale mark.
  fn put(&self, key: &str, payload: &[u8]) -> Result<()>;

  /// Delete an entry. Returns whether it existed.
  fn delete(&self, key: &str) -> Result<bool>;

  /// Delete every entry. Returns how many were removed.
  fn clear(&self) -> Result<u64>;

  /// Number of stored entries.
  fn count(&self) -> Result<u64>;

  /// Up to `limit` keys, most recently stored first.
  fn keys(&self, limit: usize) -> Result<Vec<String>>;

  /// Mark an entry stale without removing it. Returns whether it existed.
  fn mark_stale(&self, key: &str) -> Result<bool>;

  /// Sum of all payload sizes.
  fn total_size(&self) -> Result<u64>;

  /// Delete entries stored before `cutoff`. Returns how many were removed.
  fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Storage implementation that doesn't cache anything.
/// Used in degraded mode - all operations are no-ops.
pub struct NoopStorage;

impl ImageStorage for NoopStorage {
  fn get(&self, _key: &str) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn put(&self, _key: &str, _payload: &[u8]) -> Result<()> {
    Ok(()) // Discard
  }

  fn delete(&self, _key: &str) -> Result<bool> {
    Ok(false)
  }

  fn clear(&self) -> Result<u64> {
    Ok(0)
  }

  fn count(&self) -> Result<u64> {
    Ok(0)
  }

  fn keys(&self, _limit: usize) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn mark_stale(&self, _key: &str) -> Result<bool> {
    Ok(false)
  }

  fn total_size(&self) -> Result<u64> {
    Ok(0)
  }

  fn purge_older_than(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
    Ok(0)
  }
}

/// SQLite-based image storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the image database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open image store at {}: {}", path.display(), e))?;
    conn
      .busy_timeout(Duration::from_secs(3))
      .map_err(|e| eyre!("Failed to configure image store: {}", e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory image store: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for the image table.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(IMAGE_SCHEMA)
      .map_err(|e| eyre!("Failed to run image store migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for the image table.
const IMAGE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS images (
    url TEXT PRIMARY KEY,
    payload BLOB NOT NULL,
    size_bytes INTEGER NOT NULL,
    sha256 TEXT NOT NULL,
    stale INTEGER NOT NULL DEFAULT 0,
    stored_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_images_stored_at ON images(stored_at);
"#;

impl ImageStorage for SqliteStorage {
  fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, i64, String, bool, String)> = conn
      .query_row(
        "SELECT payload, size_bytes, sha256, stale, stored_at FROM images WHERE url = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read image {}: {}", key, e))?;

    match row {
      Some((payload, size_bytes, sha256, stale, stored_at)) => Ok(Some(CacheEntry {
        key: key.to_string(),
        payload,
        stored_at: parse_datetime(&stored_at)?,
        size_bytes: size_bytes.max(0) as u64,
        sha256,
        stale,
      })),
      None => Ok(None),
    }
  }

  fn put(&self, key: &str, payload: &[u8]) -> Result<()> {
    let conn = self.lock()?;
    let digest = sha256_hex(payload);

    conn
      .execute(
        "INSERT OR REPLACE INTO images (url, payload, size_bytes, sha256, stale, stored_at)
         VALUES (?, ?, ?, ?, 0, datetime('now'))",
        params![key, payload, payload.len() as i64, digest],
      )
      .map_err(|e| eyre!("Failed to store image {}: {}", key, e))?;

    Ok(())
  }

  fn delete(&self, key: &str) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM images WHERE url = ?", params![key])
      .map_err(|e| eyre!("Failed to delete image {}: {}", key, e))?;
    Ok(removed > 0)
  }

  fn clear(&self) -> Result<u64> {
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM images", [])
      .map_err(|e| eyre!("Failed to clear image store: {}", e))?;
    Ok(removed as u64)
  }

  fn count(&self) -> Result<u64> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count images: {}", e))?;
    Ok(count.max(0) as u64)
  }

  fn keys(&self, limit: usize) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT url FROM images ORDER BY stored_at DESC, url LIMIT ?")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![limit as i64], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list image keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read image key: {}", e))?;

    Ok(keys)
  }

  fn mark_stale(&self, key: &str) -> Result<bool> {
    let conn = self.lock()?;
    let updated = conn
      .execute("UPDATE images SET stale = 1 WHERE url = ?", params![key])
      .map_err(|e| eyre!("Failed to invalidate image {}: {}", key, e))?;
    Ok(updated > 0)
  }

  fn total_size(&self) -> Result<u64> {
    let conn = self.lock()?;
    let total: i64 = conn
      .query_row("SELECT COALESCE(SUM(size_bytes), 0) FROM images", [], |row| {
        row.get(0)
      })
      .map_err(|e| eyre!("Failed to sum image sizes: {}", e))?;
    Ok(total.max(0) as u64)
  }

  fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
    let conn = self.lock()?;
    let cutoff = cutoff.format(SQLITE_DATETIME).to_string();
    let removed = conn
      .execute("DELETE FROM images WHERE stored_at < ?", params![cutoff])
      .map_err(|e| eyre!("Failed to purge expired images: {}", e))?;
    Ok(removed as u64)
  }
}

/// SQLite `datetime('now')` format.
const SQLITE_DATETIME: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  chrono::NaiveDateTime::parse_from_str(s, SQLITE_DATETIME)
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

/// Hex-encoded SHA-256 of a payload.
pub fn sha256_hex(payload: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(payload);
  hex::encode(hasher.finalize())
}
