//! The image cache facade used by page code and diagnostic tooling.
//!
//! `ImageCache` wires the store, ledger, blob tracker, coordinator pool and
//! request queue together. The inbound methods never fail: the worst outcome
//! is the original URL coming back. The control methods return `Result`.

use base64::{engine::general_purpose::STANDARD, Engine};
use color_eyre::{eyre::eyre, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{
  format_stats, with_retry, BlobRef, BlobTracker, CoordinatorPool, DebugReport, Dispatcher,
  HttpFetcher, ImageQueue, ImageStore, Priority, QueueRequest, Request, ResponseBody, RetryConfig,
  StatsLedger,
};
use crate::config::Config;

/// Result of a forced refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatedImage {
  /// Live reference to the new payload; release it when done
  pub reference: BlobRef,
  pub size_bytes: u64,
  /// Whether the payload differs from what was stored before
  pub changed: bool,
}

pub struct ImageCache {
  store: Arc<ImageStore>,
  stats: Arc<StatsLedger>,
  blobs: Arc<BlobTracker>,
  pool: CoordinatorPool,
  queue: ImageQueue,
  fetcher: HttpFetcher,
}

impl ImageCache {
  /// Probe the configured store and start the coordinators and queue.
  pub async fn new(config: &Config) -> Result<Self> {
    let store = ImageStore::init(&config.store).await;
    Self::with_store(config, Arc::new(store))
  }

  /// Build the cache over an already initialised store.
  pub fn with_store(config: &Config, store: Arc<ImageStore>) -> Result<Self> {
    let stats = Arc::new(StatsLedger::new());
    let blobs = Arc::new(BlobTracker::new());
    let fetcher = HttpFetcher::new(&config.fetch)?;

    let pool = CoordinatorPool::spawn(
      config.queue.concurrency,
      Arc::clone(&store),
      Arc::clone(&stats),
      fetcher.clone(),
      config.retry,
    );

    let round_trip = RetryConfig::default().with_max_attempts(config.resolve_attempts.0);
    let dispatcher = resolver(pool.clone(), Arc::clone(&blobs), round_trip);
    let queue = ImageQueue::new(&config.queue, Arc::clone(&stats), dispatcher);

    info!(
      "Image cache ready ({} coordinators, store {})",
      pool.len(),
      if store.is_available() { "available" } else { "degraded" }
    );

    Ok(Self {
      store,
      stats,
      blobs,
      pool,
      queue,
      fetcher,
    })
  }

  pub fn stats(&self) -> &StatsLedger {
    &self.stats
  }

  // Inbound API

  /// Resolve one image to a displayable reference: a blob reference when the
  /// payload went through the cache, otherwise `url` itself.
  pub async fn resolve_image(&self, url: &str, page_id: Option<&str>) -> String {
    if url.is_empty() {
      return String::new();
    }

    if !self.store.is_available() {
      debug!("Store degraded, passing through {}", url);
      self.stats.record_miss(page_id, 0);
      return url.to_string();
    }

    self.queue.enqueue(url, page_id, Priority::Normal).await
  }

  /// Resolve several images at once. Empty and repeated URLs are skipped.
  pub async fn resolve_images_batch(
    &self,
    urls: &[String],
    page_id: Option<&str>,
    priority: Priority,
  ) -> HashMap<String, String> {
    if !self.store.is_available() {
      let mut seen = HashSet::new();
      return urls
        .iter()
        .filter(|u| !u.is_empty() && seen.insert(u.as_str()))
        .map(|u| {
          self.stats.record_miss(page_id, 0);
          (u.clone(), u.clone())
        })
        .collect::<HashMap<_, _>>();
    }

    self.queue.batch_load(urls, page_id, priority).await
  }

  pub fn is_cache_available(&self) -> bool {
    self.store.is_available()
  }

  /// Warm the cache at low priority, reporting `(done, total)` after each image.
  pub async fn preload_images<F>(
    &self,
    urls: &[String],
    page_id: Option<&str>,
    mut on_progress: F,
  ) -> HashMap<String, String>
  where
    F: FnMut(usize, usize),
  {
    let mut pending: FuturesUnordered<_> = urls
      .iter()
      .filter(|u| !u.is_empty())
      .map(|url| async move {
        let reference = self.queue.enqueue(url, page_id, Priority::Low).await;
        (url.clone(), reference)
      })
      .collect();

    let total = pending.len();
    let mut resolved = HashMap::with_capacity(total);

    while let Some((url, reference)) = pending.next().await {
      resolved.insert(url, reference);
      on_progress(resolved.len(), total);
    }

    resolved
  }

  /// Load an image as a self-contained `data:` URL.
  ///
  /// Goes through the coordinators even when the store is degraded. When the
  /// queue falls back to the URL, the image is downloaded directly instead.
  /// `None` when the payload could not be obtained either way.
  pub async fn load_as_data_url(&self, url: &str, page_id: Option<&str>) -> Option<String> {
    if url.is_empty() {
      return None;
    }

    let resolved = self.queue.enqueue(url, page_id, Priority::High).await;
    let payload = match BlobRef::parse(&resolved) {
      Some(reference) => {
        let payload = self.blobs.read(&reference);
        self.blobs.revoke(&reference);
        payload?.to_vec()
      }
      None => {
        debug!("Queue fell back for {}, downloading directly", url);
        match self.fetcher.fetch(url).await {
          Ok(payload) => payload,
          Err(e) => {
            warn!("Could not load {} as data URL: {}", url, e);
            return None;
          }
        }
      }
    };

    Some(format!(
      "data:{};base64,{}",
      sniff_mime(&payload),
      STANDARD.encode(&payload)
    ))
  }

  /// Bytes behind a reference returned by one of the resolve methods.
  pub fn read_blob(&self, reference: &str) -> Option<Arc<[u8]>> {
    BlobRef::parse(reference).and_then(|r| self.blobs.read(&r))
  }

  /// Release a reference. Remote URLs and unknown references are ignored.
  pub fn release_blob(&self, reference: &str) {
    if let Some(r) = BlobRef::parse(reference) {
      self.blobs.revoke(&r);
    }
  }

  pub fn release_all_blobs(&self) {
    self.blobs.revoke_all();
  }

  // Control API

  /// Drop every cached entry, live reference and statistic, and clear the
  /// unavailable flag. Returns whether the durable store is usable afterwards.
  pub async fn reset_all_caches(&self) -> Result<bool> {
    self.blobs.revoke_all();
    self.stats.reset_all_stats();
    self.store.reset().await
  }

  /// Re-check the durable store. Returns whether the unavailable flag was corrected.
  pub async fn sync_cache_status(&self) -> Result<bool> {
    self.store.sync_status().await
  }

  /// Global line followed by one line per page.
  pub fn display_stats(&self) -> String {
    let snapshot = self.stats.snapshot();
    let mut lines = vec![format_stats(&snapshot.global, None)];
    lines.extend(
      snapshot
        .pages
        .iter()
        .map(|(page, stats)| format_stats(stats, Some(page))),
    );
    lines.join("\n")
  }

  /// Mark an entry for refetch. Returns whether it was cached.
  pub async fn invalidate_image(&self, url: &str) -> Result<bool> {
    match self
      .control(Request::InvalidateImage {
        url: url.to_string(),
      })
      .await?
    {
      ResponseBody::InvalidateImage { existed, .. } => Ok(existed),
      other => Err(unexpected(&other)),
    }
  }

  /// Delete an entry. Returns whether it was cached.
  pub async fn remove_image(&self, url: &str) -> Result<bool> {
    match self
      .control(Request::RemoveImage {
        url: url.to_string(),
      })
      .await?
    {
      ResponseBody::RemoveImage { existed, .. } => Ok(existed),
      other => Err(unexpected(&other)),
    }
  }

  /// Refetch and overwrite an entry regardless of freshness.
  pub async fn update_image(&self, url: &str) -> Result<UpdatedImage> {
    match self
      .control(Request::UpdateImage {
        url: url.to_string(),
      })
      .await?
    {
      ResponseBody::UpdateImage {
        payload: Some(payload),
        changed,
        ..
      } => {
        let size_bytes = payload.len() as u64;
        Ok(UpdatedImage {
          reference: self.blobs.create(payload),
          size_bytes,
          changed,
        })
      }
      other => Err(unexpected(&other)),
    }
  }

  pub async fn debug_cache(&self) -> Result<DebugReport> {
    match self.control(Request::DebugCache).await? {
      ResponseBody::DebugCache {
        report: Some(report),
      } => Ok(report),
      other => Err(unexpected(&other)),
    }
  }

  pub async fn reset_stats(&self) -> Result<()> {
    self.control(Request::ResetStats).await.map(|_| ())
  }

  /// Remove entries past the configured maximum age.
  pub fn purge_expired(&self) -> Result<u64> {
    let removed = self.store.purge_expired()?;
    if removed > 0 {
      info!("Purged {} expired images", removed);
    }
    Ok(removed)
  }

  async fn control(&self, request: Request) -> Result<ResponseBody> {
    self.pool.request(request).await?.into_result()
  }
}

/// Queue dispatcher: one `GetImage` round trip, the payload registered as a blob.
fn resolver(pool: CoordinatorPool, blobs: Arc<BlobTracker>, round_trip: RetryConfig) -> Dispatcher {
  Arc::new(move |request: QueueRequest| {
    let pool = pool.clone();
    let blobs = Arc::clone(&blobs);

    async move {
      let (pool, request) = (&pool, &request);
      let body = with_retry(
        move || async move {
          pool
            .request(Request::GetImage {
              url: request.url.clone(),
              page_id: request.page_id.clone(),
            })
            .await?
            .into_result()
        },
        round_trip,
      )
      .await?;

      match body {
        ResponseBody::GetImage {
          payload: Some(payload),
          ..
        } => Ok(blobs.create(payload).to_string()),
        other => Err(unexpected(&other)),
      }
    }
    .boxed()
  })
}

fn unexpected(body: &ResponseBody) -> color_eyre::Report {
  eyre!("Unexpected coordinator response: {:?}", body)
}

/// Content type from the payload's magic bytes.
fn sniff_mime(payload: &[u8]) -> &'static str {
  match payload {
    [0x89, b'P', b'N', b'G', ..] => "image/png",
    [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
    [b'G', b'I', b'F', b'8', ..] => "image/gif",
    [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
    _ if payload.starts_with(b"<svg") || payload.starts_with(b"<?xml") => "image/svg+xml",
    _ => "application/octet-stream",
  }
}
