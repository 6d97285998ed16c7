//! Hit/miss/error counters, globally and per page.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::warn;

/// Counters for one page, or for the whole session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  pub errors: u64,
  pub total_size_bytes: u64,
  pub last_reset_at: DateTime<Utc>,
}

impl CacheStats {
  pub fn new() -> Self {
    Self {
      hits: 0,
      misses: 0,
      errors: 0,
      total_size_bytes: 0,
      last_reset_at: Utc::now(),
    }
  }

  /// Percentage of lookups served from the cache, rounded. 0 with no samples.
  pub fn hit_rate(&self) -> u64 {
    let total = self.hits + self.misses;
    if total == 0 {
      return 0;
    }
    (self.hits as f64 * 100.0 / total as f64).round() as u64
  }

  /// Whole seconds elapsed since the counters were last reset.
  pub fn duration_seconds(&self) -> i64 {
    (Utc::now() - self.last_reset_at).num_seconds()
  }

  fn reset(&mut self) {
    *self = Self::new();
  }
}

impl Default for CacheStats {
  fn default() -> Self {
    Self::new()
  }
}

/// Serializable copy of the whole ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
  pub global: CacheStats,
  pub pages: BTreeMap<String, CacheStats>,
}

#[derive(Debug, Default)]
struct LedgerInner {
  global: CacheStats,
  pages: BTreeMap<String, CacheStats>,
}

impl LedgerInner {
  /// Page counters for a non-empty page id, created on first use.
  fn page(&mut self, page_id: Option<&str>) -> Option<&mut CacheStats> {
    match page_id {
      Some(id) if !id.is_empty() => Some(self.pages.entry(id.to_string()).or_default()),
      _ => None,
    }
  }
}

/// Statistics ledger shared by the queue and every coordinator instance.
#[derive(Debug, Default)]
pub struct StatsLedger {
  inner: Mutex<LedgerInner>,
}

impl StatsLedger {
  pub fn new() -> Self {
    Self::default()
  }

  fn update(&self, f: impl FnOnce(&mut LedgerInner)) {
    match self.inner.lock() {
      Ok(mut inner) => f(&mut inner),
      Err(e) => warn!("Stats ledger lock poisoned: {}", e),
    }
  }

  pub fn record_hit(&self, page_id: Option<&str>, size_bytes: u64) {
    self.update(|inner| {
      inner.global.hits += 1;
      inner.global.total_size_bytes += size_bytes;
      if let Some(page) = inner.page(page_id) {
        page.hits += 1;
        page.total_size_bytes += size_bytes;
      }
    });
  }

  pub fn record_miss(&self, page_id: Option<&str>, size_bytes: u64) {
    self.update(|inner| {
      inner.global.misses += 1;
      inner.global.total_size_bytes += size_bytes;
      if let Some(page) = inner.page(page_id) {
        page.misses += 1;
        page.total_size_bytes += size_bytes;
      }
    });
  }

  pub fn record_error(&self, page_id: Option<&str>) {
    self.update(|inner| {
      inner.global.errors += 1;
      if let Some(page) = inner.page(page_id) {
        page.errors += 1;
      }
    });
  }

  pub fn page_stats(&self, page_id: &str) -> Option<CacheStats> {
    self
      .inner
      .lock()
      .ok()
      .and_then(|inner| inner.pages.get(page_id).cloned())
  }

  pub fn global_stats(&self) -> CacheStats {
    self
      .inner
      .lock()
      .map(|inner| inner.global.clone())
      .unwrap_or_default()
  }

  /// Page ids seen so far, sorted.
  pub fn page_ids(&self) -> Vec<String> {
    self
      .inner
      .lock()
      .map(|inner| inner.pages.keys().cloned().collect())
      .unwrap_or_default()
  }

  /// Zero the counters of one page (creating it if unknown).
  pub fn reset_page_stats(&self, page_id: &str) {
    self.update(|inner| {
      if let Some(page) = inner.page(Some(page_id)) {
        page.reset();
      }
    });
  }

  /// Zero the global counters and every page's counters.
  pub fn reset_all_stats(&self) {
    self.update(|inner| {
      inner.global.reset();
      for page in inner.pages.values_mut() {
        page.reset();
      }
    });
  }

  pub fn snapshot(&self) -> LedgerSnapshot {
    self
      .inner
      .lock()
      .map(|inner| LedgerSnapshot {
        global: inner.global.clone(),
        pages: inner.pages.clone(),
      })
      .unwrap_or_else(|_| LedgerSnapshot {
        global: CacheStats::new(),
        pages: BTreeMap::new(),
      })
  }
}

/// One-line summary, e.g. `[Builds] Cache: 75% hits (3/4) - 1.2MB - 30s`.
pub fn format_stats(stats: &CacheStats, page_id: Option<&str>) -> String {
  let total = stats.hits + stats.misses;
  let prefix = page_id.map(|p| format!("[{}] ", p)).unwrap_or_default();
  let size_mb = (stats.total_size_bytes as f64 / (1024.0 * 1024.0) * 10.0).round() / 10.0;

  format!(
    "{}Cache: {}% hits ({}/{}) - {}MB - {}s",
    prefix,
    stats.hit_rate(),
    stats.hits,
    total,
    size_mb,
    stats.duration_seconds()
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn test_hit_rate_rounding() {
    let ledger = StatsLedger::new();
    for _ in 0..2 {
      ledger.record_hit(Some("tier-list"), 0);
    }
    ledger.record_miss(Some("tier-list"), 0);

    let stats = ledger.page_stats("tier-list").unwrap();
    // 2/3 = 66.67 -> 67
    assert_eq!(stats.hit_rate(), 67);
    assert_eq!(ledger.global_stats().hit_rate(), 67);
  }

  #[test]
  fn test_hit_rate_without_samples_is_zero() {
    assert_eq!(CacheStats::new().hit_rate(), 0);
  }

  #[test]
  fn test_global_updated_without_page() {
    let ledger = StatsLedger::new();
    ledger.record_hit(None, 100);
    ledger.record_miss(Some(""), 50);
    ledger.record_error(None);

    let global = ledger.global_stats();
    assert_eq!(global.hits, 1);
    assert_eq!(global.misses, 1);
    assert_eq!(global.errors, 1);
    assert_eq!(global.total_size_bytes, 150);
    assert!(ledger.page_ids().is_empty());
  }

  #[test]
  fn test_pages_created_lazily() {
    let ledger = StatsLedger::new();
    assert!(ledger.page_stats("builds").is_none());

    ledger.record_error(Some("builds"));
    let page = ledger.page_stats("builds").unwrap();
    assert_eq!(page.errors, 1);
    assert_eq!(page.hits, 0);
    assert_eq!(ledger.page_ids(), vec!["builds".to_string()]);
  }

  #[test]
  fn test_reset_page_leaves_others() {
    let ledger = StatsLedger::new();
    ledger.record_hit(Some("a"), 10);
    ledger.record_hit(Some("b"), 10);

    ledger.reset_page_stats("a");

    assert_eq!(ledger.page_stats("a").unwrap().hits, 0);
    assert_eq!(ledger.page_stats("b").unwrap().hits, 1);
    assert_eq!(ledger.global_stats().hits, 2);
  }

  #[test]
  fn test_reset_all_zeroes_and_advances_timestamp() {
    let ledger = StatsLedger::new();
    ledger.record_hit(Some("a"), 10);
    ledger.record_miss(Some("b"), 10);
    let before = ledger.global_stats().last_reset_at;

    std::thread::sleep(std::time::Duration::from_millis(5));
    ledger.reset_all_stats();

    let global = ledger.global_stats();
    assert_eq!((global.hits, global.misses, global.errors), (0, 0, 0));
    assert_eq!(global.total_size_bytes, 0);
    assert!(global.last_reset_at > before);
    for id in ledger.page_ids() {
      let page = ledger.page_stats(&id).unwrap();
      assert_eq!((page.hits, page.misses, page.errors), (0, 0, 0));
    }
  }

  #[test]
  fn test_format_stats() {
    let stats = CacheStats {
      hits: 3,
      misses: 1,
      errors: 0,
      total_size_bytes: 1024 * 1024,
      last_reset_at: Utc::now(),
    };
    assert_eq!(
      format_stats(&stats, Some("PromoCodes")),
      "[PromoCodes] Cache: 75% hits (3/4) - 1MB - 0s"
    );
  }
}
