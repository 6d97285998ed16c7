//! Client-side image caching pipeline.
//!
//! Leaf-first: [`blob`] tracks handed-out payload references, [`retry`] wraps
//! async operations in backoff, [`stats`] keeps the hit/miss ledger,
//! [`storage`] and [`store`] persist payloads with a degraded fallback,
//! [`coordinator`] runs lookup/fetch/store as message-driven workers, and
//! [`queue`] throttles requests into them.

pub mod blob;
pub mod coordinator;
pub mod fetch;
pub mod queue;
pub mod retry;
pub mod stats;
pub mod storage;
pub mod store;

pub use blob::{BlobRef, BlobTracker};
pub use coordinator::{
  Coordinator, CoordinatorHandle, CoordinatorPool, DebugReport, Request, Response, ResponseBody,
};
pub use fetch::HttpFetcher;
pub use queue::{Dispatcher, ImageQueue, Priority, QueueRequest};
pub use retry::{calculate_backoff, with_retry, with_retry_cancellable, RetryConfig};
pub use stats::{format_stats, CacheStats, LedgerSnapshot, StatsLedger};
pub use storage::{CacheEntry, ImageStorage, NoopStorage, SqliteStorage};
pub use store::{DegradedFlag, ImageStore};
