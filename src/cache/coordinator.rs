//! Cache coordinator: the background worker that owns lookup, fetch and store.
//!
//! Each coordinator runs as its own task and is reachable only through a
//! [`CoordinatorHandle`]. Requests are processed one at a time per instance.
//! A [`CoordinatorPool`] runs several instances over one shared inbox, so a
//! request is taken by whichever instance is idle first. Instances share
//! nothing but the inbox, the [`ImageStore`] and the [`StatsLedger`].

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use super::fetch::HttpFetcher;
use super::retry::{with_retry, RetryConfig};
use super::stats::{LedgerSnapshot, StatsLedger};
use super::storage::sha256_hex;
use super::store::ImageStore;

/// Number of keys included in a debug report.
const DEBUG_SAMPLE_KEYS: usize = 10;

/// Messages accepted by a coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
  /// Serve from the store, or fetch and store on a miss
  GetImage {
    url: String,
    #[serde(rename = "pageId", default, skip_serializing_if = "Option::is_none")]
    page_id: Option<String>,
  },
  /// Mark the entry stale so the next lookup refetches it
  InvalidateImage { url: String },
  /// Delete the entry
  RemoveImage { url: String },
  /// Refetch and overwrite regardless of freshness
  UpdateImage { url: String },
  /// Zero all statistics
  ResetStats,
  /// Report store and ledger state
  DebugCache,
}

/// Store and ledger state returned by [`Request::DebugCache`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugReport {
  pub available: bool,
  pub count: u64,
  pub total_size_bytes: u64,
  pub sample_keys: Vec<String>,
  pub stats: LedgerSnapshot,
}

/// Reply body, tagged with the same `type` as the request it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ResponseBody {
  GetImage {
    url: String,
    #[serde(default, with = "payload_b64", skip_serializing_if = "Option::is_none")]
    payload: Option<Vec<u8>>,
    #[serde(rename = "fromCache")]
    from_cache: bool,
  },
  InvalidateImage {
    url: String,
    existed: bool,
  },
  RemoveImage {
    url: String,
    existed: bool,
  },
  UpdateImage {
    url: String,
    #[serde(default, with = "payload_b64", skip_serializing_if = "Option::is_none")]
    payload: Option<Vec<u8>>,
    changed: bool,
  },
  ResetStats,
  DebugCache {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    report: Option<DebugReport>,
  },
}

/// Coordinator reply. Failures are reported in `error`, never by dropping the reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  #[serde(flatten)]
  pub body: ResponseBody,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl Response {
  fn ok(body: ResponseBody) -> Self {
    Self { body, error: None }
  }

  fn failed(body: ResponseBody, error: &color_eyre::Report) -> Self {
    Self {
      body,
      error: Some(format!("{:#}", error)),
    }
  }

  /// Turn an error reply into an `Err`.
  pub fn into_result(self) -> Result<ResponseBody> {
    match self.error {
      Some(error) => Err(eyre!(error)),
      None => Ok(self.body),
    }
  }
}

mod payload_b64 {
  use base64::{engine::general_purpose::STANDARD, Engine};
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(payload: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
    match payload {
      Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
      None => s.serialize_none(),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
    let encoded: Option<String> = Option::deserialize(d)?;
    encoded
      .map(|e| STANDARD.decode(e).map_err(serde::de::Error::custom))
      .transpose()
  }
}

type Envelope = (Request, oneshot::Sender<Response>);

/// Receiving end shared by every instance of a pool.
type Inbox = Arc<Mutex<mpsc::Receiver<Envelope>>>;

const INBOX_CAPACITY: usize = 64;

/// Cache orchestration worker.
pub struct Coordinator {
  id: usize,
  store: Arc<ImageStore>,
  stats: Arc<StatsLedger>,
  fetcher: HttpFetcher,
  retry: RetryConfig,
}

impl Coordinator {
  pub fn new(
    id: usize,
    store: Arc<ImageStore>,
    stats: Arc<StatsLedger>,
    fetcher: HttpFetcher,
    retry: RetryConfig,
  ) -> Self {
    Self {
      id,
      store,
      stats,
      fetcher,
      retry,
    }
  }

  /// Start the worker task with its own inbox and return its handle.
  pub fn spawn(self) -> CoordinatorHandle {
    let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
    tokio::spawn(self.run(Arc::new(Mutex::new(rx))));
    CoordinatorHandle { tx }
  }

  async fn run(self, inbox: Inbox) {
    debug!("Coordinator {} started", self.id);

    loop {
      // Only idle instances wait on the inbox; the lock is released before handling
      let next = inbox.lock().await.recv().await;
      let Some((request, reply)) = next else {
        break;
      };

      let response = self.handle(request).await;
      // The requester may have given up (queue timeout); the work is done anyway
      let _ = reply.send(response);
    }

    debug!("Coordinator {} stopped", self.id);
  }

  /// Process one request. Never fails; errors are carried in the response.
  pub async fn handle(&self, request: Request) -> Response {
    match request {
      Request::GetImage { url, page_id } => {
        let page = page_id.as_deref();
        match self.get_image(&url, page).await {
          Ok((payload, from_cache)) => Response::ok(ResponseBody::GetImage {
            url,
            payload: Some(payload),
            from_cache,
          }),
          Err(e) => {
            warn!("Coordinator {}: failed to load {}: {}", self.id, url, e);
            self.stats.record_error(page);
            Response::failed(
              ResponseBody::GetImage {
                url,
                payload: None,
                from_cache: false,
              },
              &e,
            )
          }
        }
      }

      Request::InvalidateImage { url } => match self.store.mark_stale(&url) {
        Ok(existed) => {
          info!("Marked {} for refetch (present: {})", url, existed);
          Response::ok(ResponseBody::InvalidateImage { url, existed })
        }
        Err(e) => self.control_failure(ResponseBody::InvalidateImage { url, existed: false }, e),
      },

      Request::RemoveImage { url } => match self.store.delete(&url) {
        Ok(existed) => {
          info!("Removed {} from cache (present: {})", url, existed);
          Response::ok(ResponseBody::RemoveImage { url, existed })
        }
        Err(e) => self.control_failure(ResponseBody::RemoveImage { url, existed: false }, e),
      },

      Request::UpdateImage { url } => match self.update_image(&url).await {
        Ok((payload, changed)) => Response::ok(ResponseBody::UpdateImage {
          url,
          payload: Some(payload),
          changed,
        }),
        Err(e) => self.control_failure(
          ResponseBody::UpdateImage {
            url,
            payload: None,
            changed: false,
          },
          e,
        ),
      },

      Request::ResetStats => {
        self.stats.reset_all_stats();
        Response::ok(ResponseBody::ResetStats)
      }

      Request::DebugCache => match self.debug_report() {
        Ok(report) => Response::ok(ResponseBody::DebugCache {
          report: Some(report),
        }),
        Err(e) => self.control_failure(ResponseBody::DebugCache { report: None }, e),
      },
    }
  }

  fn control_failure(&self, body: ResponseBody, error: color_eyre::Report) -> Response {
    warn!("Coordinator {}: {}", self.id, error);
    self.stats.record_error(None);
    Response::failed(body, &error)
  }

  async fn get_image(&self, url: &str, page: Option<&str>) -> Result<(Vec<u8>, bool)> {
    if !self.store.is_available() {
      // Degraded: plain download, nothing to look up or persist
      let payload = self.fetch(url, page).await?;
      return Ok((payload, false));
    }

    match self.store.get(url) {
      Ok(Some(entry)) if !entry.stale => {
        debug!("Cache hit: {}", url);
        self.stats.record_hit(page, entry.size_bytes);
        return Ok((entry.payload, true));
      }
      Ok(Some(_)) => debug!("Entry invalidated, refetching: {}", url),
      Ok(None) => debug!("Cache miss: {}", url),
      Err(e) => warn!("Store lookup failed for {}, treating as miss: {}", url, e),
    }

    let payload = self.fetch(url, page).await?;
    self.persist(url, &payload);
    Ok((payload, false))
  }

  /// Network fetch with retry. Every fetch is a miss in the ledger.
  async fn fetch(&self, url: &str, page: Option<&str>) -> Result<Vec<u8>> {
    let fetcher = &self.fetcher;
    match with_retry(|| fetcher.fetch(url), self.retry).await {
      Ok(payload) => {
        self.stats.record_miss(page, payload.len() as u64);
        Ok(payload)
      }
      Err(e) => {
        self.stats.record_miss(page, 0);
        Err(e)
      }
    }
  }

  /// Write to the store. Failure is logged; the caller still gets the payload.
  fn persist(&self, url: &str, payload: &[u8]) {
    match self.store.put(url, payload) {
      Ok(()) => debug!("Stored {} ({} KB)", url, payload.len() / 1024),
      Err(e) => warn!("Could not persist {}: {}", url, e),
    }
  }

  async fn update_image(&self, url: &str) -> Result<(Vec<u8>, bool)> {
    let previous = self.store.get(url).ok().flatten().map(|e| e.sha256);
    let fetcher = &self.fetcher;
    let payload = with_retry(|| fetcher.fetch(url), self.retry).await?;

    if self.store.is_available() {
      self.store.put(url, &payload)?;
    }

    let changed = previous.as_deref() != Some(sha256_hex(&payload).as_str());
    info!("Updated {} (changed: {})", url, changed);
    Ok((payload, changed))
  }

  fn debug_report(&self) -> Result<DebugReport> {
    Ok(DebugReport {
      available: self.store.is_available(),
      count: self.store.count()?,
      total_size_bytes: self.store.total_size()?,
      sample_keys: self.store.keys(DEBUG_SAMPLE_KEYS)?,
      stats: self.stats.snapshot(),
    })
  }
}

/// Address of a running coordinator, or of a whole pool.
#[derive(Clone)]
pub struct CoordinatorHandle {
  tx: mpsc::Sender<Envelope>,
}

impl CoordinatorHandle {
  /// Send a request and wait for its reply.
  pub async fn request(&self, request: Request) -> Result<Response> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self
      .tx
      .send((request, reply_tx))
      .await
      .map_err(|_| eyre!("Coordinator channel closed"))?;

    reply_rx
      .await
      .map_err(|_| eyre!("Coordinator dropped the request"))
  }
}

/// Fixed set of coordinators pulling from one inbox.
#[derive(Clone)]
pub struct CoordinatorPool {
  handle: CoordinatorHandle,
  size: usize,
}

impl CoordinatorPool {
  /// Spawn `size` coordinators (at least one) sharing `store` and `stats`.
  pub fn spawn(
    size: usize,
    store: Arc<ImageStore>,
    stats: Arc<StatsLedger>,
    fetcher: HttpFetcher,
    retry: RetryConfig,
  ) -> Self {
    let size = size.max(1);
    let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
    let inbox: Inbox = Arc::new(Mutex::new(rx));

    for id in 0..size {
      let coordinator = Coordinator::new(
        id,
        Arc::clone(&store),
        Arc::clone(&stats),
        fetcher.clone(),
        retry,
      );
      tokio::spawn(coordinator.run(Arc::clone(&inbox)));
    }

    Self {
      handle: CoordinatorHandle { tx },
      size,
    }
  }

  pub fn len(&self) -> usize {
    self.size
  }

  pub fn is_empty(&self) -> bool {
    self.size == 0
  }

  /// Hand the request to the first idle coordinator.
  pub async fn request(&self, request: Request) -> Result<Response> {
    self.handle.request(request).await
  }
}
