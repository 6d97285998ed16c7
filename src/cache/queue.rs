//! Bounded-concurrency request queue with priority classes and timeout eviction.
//!
//! Items wait in a pending list until a scheduling tick hands them to the
//! dispatcher. Ticks run on a fixed interval and immediately after any
//! enqueue or completed dispatch. Every enqueued URL resolves exactly once:
//! with the dispatcher's result, or with the URL itself on error or timeout.

use color_eyre::Result;
use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::stats::StatsLedger;
use crate::config::QueueConfig;

/// Scheduling precedence. Lower value dispatches first.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  High = 0,
  #[default]
  Normal = 1,
  Low = 2,
}

/// What the dispatcher is asked to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRequest {
  pub url: String,
  pub page_id: Option<String>,
}

/// Resolves one request to a displayable reference.
pub type Dispatcher = Arc<dyn Fn(QueueRequest) -> BoxFuture<'static, Result<String>> + Send + Sync>;

struct QueueItem {
  request: QueueRequest,
  priority: Priority,
  enqueued_at: Instant,
  seq: u64,
  reply: oneshot::Sender<String>,
}

impl QueueItem {
  fn resolve(self, reference: String) {
    // Receiver gone means the caller stopped waiting
    let _ = self.reply.send(reference);
  }

  fn fall_back(self) {
    let url = self.request.url.clone();
    self.resolve(url);
  }
}

struct Shared {
  pending: Mutex<Vec<QueueItem>>,
  active: AtomicUsize,
  seq: AtomicU64,
  wake: Notify,
  dispatcher: Dispatcher,
  stats: Arc<StatsLedger>,
  concurrency: usize,
  timeout: Duration,
}

impl Shared {
  fn pending(&self) -> MutexGuard<'_, Vec<QueueItem>> {
    self.pending.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// One scheduling pass: evict expired items, then fill free slots.
  fn tick(self: &Arc<Self>) {
    let now = Instant::now();

    let (expired, ready) = {
      let mut pending = self.pending();
      pending.sort_by_key(|item| (item.priority, item.enqueued_at, item.seq));

      let (expired, waiting): (Vec<_>, Vec<_>) = pending
        .drain(..)
        .partition(|item| now.duration_since(item.enqueued_at) >= self.timeout);
      *pending = waiting;

      let free = self
        .concurrency
        .saturating_sub(self.active.load(Ordering::SeqCst))
        .min(pending.len());
      let ready: Vec<_> = pending.drain(..free).collect();
      self.active.fetch_add(ready.len(), Ordering::SeqCst);

      (expired, ready)
    };

    for item in expired {
      warn!(
        "Queue wait exceeded {:?}, using original URL: {}",
        self.timeout, item.request.url
      );
      item.fall_back();
    }

    for item in ready {
      self.dispatch(item);
    }
  }

  fn dispatch(self: &Arc<Self>, item: QueueItem) {
    let shared = Arc::clone(self);
    debug!(
      "Dispatching {} ({:?}, waited {:?})",
      item.request.url,
      item.priority,
      item.enqueued_at.elapsed()
    );

    tokio::spawn(async move {
      let work = (shared.dispatcher)(item.request.clone());

      match tokio::time::timeout(shared.timeout, work).await {
        Ok(Ok(reference)) => item.resolve(reference),
        Ok(Err(e)) => {
          warn!("Resolution failed for {}: {}", item.request.url, e);
          item.fall_back();
        }
        Err(_) => {
          warn!(
            "Resolution of {} exceeded {:?}, using original URL",
            item.request.url, shared.timeout
          );
          shared.stats.record_error(item.request.page_id.as_deref());
          item.fall_back();
        }
      }

      shared.active.fetch_sub(1, Ordering::SeqCst);
      shared.wake.notify_one();
    });
  }
}

/// Throttled front door to the cache coordinators.
pub struct ImageQueue {
  shared: Arc<Shared>,
  shutdown: CancellationToken,
}

impl ImageQueue {
  /// Create the queue and start its scheduler. Must be called inside a tokio runtime.
  pub fn new(config: &QueueConfig, stats: Arc<StatsLedger>, dispatcher: Dispatcher) -> Self {
    let shared = Arc::new(Shared {
      pending: Mutex::new(Vec::new()),
      active: AtomicUsize::new(0),
      seq: AtomicU64::new(0),
      wake: Notify::new(),
      dispatcher,
      stats,
      concurrency: config.concurrency.max(1),
      timeout: config.timeout(),
    });
    let shutdown = CancellationToken::new();

    tokio::spawn(scheduler(
      Arc::clone(&shared),
      config.tick_interval(),
      shutdown.clone(),
    ));

    Self { shared, shutdown }
  }

  /// Queue one URL and wait for its resolved reference.
  ///
  /// Never fails. An empty URL resolves to an empty string without queueing.
  pub async fn enqueue(&self, url: &str, page_id: Option<&str>, priority: Priority) -> String {
    if url.is_empty() {
      return String::new();
    }

    let (reply, resolved) = oneshot::channel();
    let item = QueueItem {
      request: QueueRequest {
        url: url.to_string(),
        page_id: page_id.map(str::to_string),
      },
      priority,
      enqueued_at: Instant::now(),
      seq: self.shared.seq.fetch_add(1, Ordering::Relaxed),
      reply,
    };

    self.shared.pending().push(item);
    self.shared.wake.notify_one();

    resolved.await.unwrap_or_else(|_| url.to_string())
  }

  /// Resolve many URLs concurrently. Empty and repeated URLs are queued once.
  pub async fn batch_load(
    &self,
    urls: &[String],
    page_id: Option<&str>,
    priority: Priority,
  ) -> HashMap<String, String> {
    let mut seen = HashSet::new();
    let unique: Vec<&String> = urls
      .iter()
      .filter(|u| !u.is_empty() && seen.insert(u.as_str()))
      .collect();

    join_all(unique.into_iter().map(|url| async move {
      let reference = self.enqueue(url, page_id, priority).await;
      (url.clone(), reference)
    }))
    .await
    .into_iter()
    .collect()
  }

  /// Images currently on screen.
  pub async fn load_visible(&self, urls: &[String], page_id: Option<&str>) -> HashMap<String, String> {
    self.batch_load(urls, page_id, Priority::High).await
  }

  /// Images likely needed soon; yields to everything else.
  pub async fn preload_future(&self, urls: &[String], page_id: Option<&str>) -> HashMap<String, String> {
    self.batch_load(urls, page_id, Priority::Low).await
  }

  /// Items waiting for a slot.
  pub fn pending(&self) -> usize {
    self.shared.pending().len()
  }

  /// Items currently dispatched.
  pub fn active(&self) -> usize {
    self.shared.active.load(Ordering::SeqCst)
  }
}

impl Drop for ImageQueue {
  fn drop(&mut self) {
    self.shutdown.cancel();
  }
}

async fn scheduler(shared: Arc<Shared>, tick_interval: Duration, shutdown: CancellationToken) {
  let mut ticker = tokio::time::interval(tick_interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      _ = ticker.tick() => {}
      _ = shared.wake.notified() => {}
    }
    shared.tick();
  }

  // Release anyone still waiting
  let leftover: Vec<QueueItem> = shared.pending().drain(..).collect();
  for item in leftover {
    item.fall_back();
  }
  debug!("Queue scheduler stopped");
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;
  use futures::FutureExt;
  use pretty_assertions::assert_eq;

  fn config(concurrency: usize, timeout_ms: u64) -> QueueConfig {
    QueueConfig {
      concurrency,
      tick_interval_ms: 100,
      timeout_ms,
    }
  }

  fn queue_with<F>(config: QueueConfig, f: F) -> (Arc<ImageQueue>, Arc<StatsLedger>)
  where
    F: Fn(QueueRequest) -> BoxFuture<'static, Result<String>> + Send + Sync + 'static,
  {
    let stats = Arc::new(StatsLedger::new());
    let queue = ImageQueue::new(&config, Arc::clone(&stats), Arc::new(f));
    (Arc::new(queue), stats)
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrency_cap() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (Arc::clone(&active), Arc::clone(&peak));

    let (queue, _) = queue_with(config(3, 15_000), move |req| {
      let (a, p) = (Arc::clone(&a), Arc::clone(&p));
      async move {
        let now = a.fetch_add(1, Ordering::SeqCst) + 1;
        p.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.fetch_sub(1, Ordering::SeqCst);
        Ok(format!("blob:{}", req.url))
      }
      .boxed()
    });

    let urls: Vec<String> = (0..10).map(|i| format!("https://cdn/{}.webp", i)).collect();
    let resolved = queue.batch_load(&urls, Some("builds"), Priority::Normal).await;

    assert_eq!(resolved.len(), 10);
    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert_eq!(resolved["https://cdn/4.webp"], "blob:https://cdn/4.webp");
  }

  #[tokio::test(start_paused = true)]
  async fn test_high_priority_overtakes_low() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let o = Arc::clone(&order);

    let (queue, _) = queue_with(config(1, 15_000), move |req| {
      let o = Arc::clone(&o);
      async move {
        o.lock().unwrap().push(req.url.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(req.url)
      }
      .boxed()
    });

    let q = Arc::clone(&queue);
    let blocker = tokio::spawn(async move { q.enqueue("blocker", None, Priority::Normal).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(queue.active(), 1);

    let q = Arc::clone(&queue);
    let low = tokio::spawn(async move { q.enqueue("low", None, Priority::Low).await });
    tokio::time::sleep(Duration::from_millis(1)).await;
    let q = Arc::clone(&queue);
    let high = tokio::spawn(async move { q.enqueue("high", None, Priority::High).await });

    blocker.await.unwrap();
    low.await.unwrap();
    high.await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["blocker", "high", "low"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_queue_timeout_resolves_with_url_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);

    let (queue, _) = queue_with(config(1, 1_000), move |req| {
      c.fetch_add(1, Ordering::SeqCst);
      async move {
        if req.url == "stuck" {
          futures::future::pending::<()>().await;
        }
        Ok(format!("blob:{}", req.url))
      }
      .boxed()
    });

    // Both queued in the same instant; the stuck one takes the only slot
    let (stuck, late) = tokio::join!(
      queue.enqueue("stuck", None, Priority::High),
      queue.enqueue("https://cdn/late.webp", None, Priority::Low),
    );

    assert_eq!(late, "https://cdn/late.webp");
    assert_eq!(stuck, "stuck");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(queue.pending(), 0);
  }

  #[tokio::test]
  async fn test_dispatch_error_falls_back_to_url() {
    let (queue, _) = queue_with(config(3, 15_000), |_| {
      async { Err(eyre!("network down")) }.boxed()
    });

    let resolved = queue
      .enqueue("https://cdn/a.webp", Some("codes"), Priority::Normal)
      .await;
    assert_eq!(resolved, "https://cdn/a.webp");
  }

  #[tokio::test(start_paused = true)]
  async fn test_dispatch_timeout_records_error() {
    let (queue, stats) = queue_with(config(1, 500), |_| {
      async {
        futures::future::pending::<()>().await;
        Ok(String::new())
      }
      .boxed()
    });

    let resolved = queue
      .enqueue("https://cdn/slow.webp", Some("tiers"), Priority::Normal)
      .await;

    assert_eq!(resolved, "https://cdn/slow.webp");
    assert_eq!(stats.page_stats("tiers").unwrap().errors, 1);
  }

  #[tokio::test]
  async fn test_batch_skips_empty_and_duplicates() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    let (queue, _) = queue_with(config(3, 15_000), move |req| {
      c.fetch_add(1, Ordering::SeqCst);
      async move { Ok(format!("blob:{}", req.url)) }.boxed()
    });

    let urls = vec![
      "https://cdn/a.webp".to_string(),
      String::new(),
      "https://cdn/a.webp".to_string(),
      "https://cdn/b.webp".to_string(),
    ];
    let resolved = queue.load_visible(&urls, None).await;

    assert_eq!(resolved.len(), 2);
    assert!(!resolved.contains_key(""));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_empty_url_not_queued() {
    let (queue, _) = queue_with(config(3, 15_000), |_| async { Ok("x".to_string()) }.boxed());
    assert_eq!(queue.enqueue("", None, Priority::High).await, "");
    assert_eq!(queue.pending(), 0);
  }
}
