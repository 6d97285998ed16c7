//! Tracked blob references for payloads handed out to callers.
//!
//! Every payload served from the cache is registered here under a local
//! reference id so it can be released explicitly when the consumer is done.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

/// Prefix of every reference id created by the tracker.
pub const BLOB_SCHEME: &str = "blob:imgcache/";

/// Handle to an in-memory payload registered with a [`BlobTracker`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobRef {
  id: String,
}

impl BlobRef {
  /// Rebuild a handle from a reference id previously returned to a caller.
  ///
  /// Returns `None` for strings that are not blob references (e.g. remote URLs).
  pub fn parse(id: &str) -> Option<Self> {
    id.starts_with(BLOB_SCHEME).then(|| Self { id: id.to_string() })
  }

  pub fn as_str(&self) -> &str {
    &self.id
  }
}

impl fmt::Display for BlobRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.id)
  }
}

/// Registry of live blob references.
#[derive(Debug, Default)]
pub struct BlobTracker {
  next_id: AtomicU64,
  live: Mutex<HashMap<String, Arc<[u8]>>>,
}

impl BlobTracker {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a payload and return a fresh reference to it.
  pub fn create(&self, payload: impl Into<Arc<[u8]>>) -> BlobRef {
    let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    let reference = BlobRef {
      id: format!("{}{}", BLOB_SCHEME, n),
    };
    match self.live.lock() {
      Ok(mut live) => {
        live.insert(reference.id.clone(), payload.into());
      }
      Err(e) => warn!("Blob registry lock poisoned: {}", e),
    }
    reference
  }

  /// Release a reference. Unknown or already released references are ignored.
  pub fn revoke(&self, reference: &BlobRef) {
    if let Ok(mut live) = self.live.lock() {
      if live.remove(&reference.id).is_some() {
        debug!("Released {}", reference);
      }
    }
  }

  /// Release every live reference.
  pub fn revoke_all(&self) {
    if let Ok(mut live) = self.live.lock() {
      let count = live.len();
      live.clear();
      debug!("Released {} blob references", count);
    }
  }

  /// Release `old` (if any and still live) and register `payload` in its place.
  pub fn replace(&self, old: Option<&BlobRef>, payload: impl Into<Arc<[u8]>>) -> BlobRef {
    if let Some(old) = old {
      self.revoke(old);
    }
    self.create(payload)
  }

  /// Read the payload behind a live reference.
  pub fn read(&self, reference: &BlobRef) -> Option<Arc<[u8]>> {
    self
      .live
      .lock()
      .ok()
      .and_then(|live| live.get(&reference.id).cloned())
  }

  pub fn is_live(&self, reference: &BlobRef) -> bool {
    self
      .live
      .lock()
      .map(|live| live.contains_key(&reference.id))
      .unwrap_or(false)
  }

  /// Number of live references.
  pub fn len(&self) -> usize {
    self.live.lock().map(|live| live.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_create_registers_unique_references() {
    let tracker = BlobTracker::new();
    let a = tracker.create(vec![1u8, 2, 3]);
    let b = tracker.create(vec![4u8]);

    assert_ne!(a, b);
    assert!(a.as_str().starts_with(BLOB_SCHEME));
    assert_eq!(tracker.len(), 2);
    assert_eq!(tracker.read(&a).as_deref(), Some(&[1u8, 2, 3][..]));
  }

  #[test]
  fn test_revoke_is_idempotent() {
    let tracker = BlobTracker::new();
    let a = tracker.create(vec![1u8]);

    tracker.revoke(&a);
    assert!(!tracker.is_live(&a));

    // Second release is a no-op
    tracker.revoke(&a);
    assert!(tracker.is_empty());
  }

  #[test]
  fn test_revoke_unknown_reference_is_noop() {
    let tracker = BlobTracker::new();
    let kept = tracker.create(vec![9u8]);
    let foreign = BlobRef::parse("blob:imgcache/999").unwrap();

    tracker.revoke(&foreign);
    assert!(tracker.is_live(&kept));
  }

  #[test]
  fn test_replace_releases_old_reference() {
    let tracker = BlobTracker::new();
    let old = tracker.create(vec![1u8]);
    let new = tracker.replace(Some(&old), vec![2u8]);

    assert!(!tracker.is_live(&old));
    assert!(tracker.is_live(&new));
    assert_eq!(tracker.len(), 1);

    let fresh = tracker.replace(None, vec![3u8]);
    assert!(tracker.is_live(&fresh));
    assert_eq!(tracker.len(), 2);
  }

  #[test]
  fn test_revoke_all() {
    let tracker = BlobTracker::new();
    tracker.create(vec![1u8]);
    tracker.create(vec![2u8]);

    tracker.revoke_all();
    assert!(tracker.is_empty());
  }

  #[test]
  fn test_parse_rejects_remote_urls() {
    assert!(BlobRef::parse("https://example.com/a.webp").is_none());
    assert!(BlobRef::parse("blob:imgcache/1").is_some());
  }
}
