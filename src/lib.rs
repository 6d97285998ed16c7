//! Image caching pipeline: a persistent, throttled, retrying cache for image
//! payloads keyed by URL, with per-page hit/miss statistics.

pub mod cache;
pub mod config;
pub mod logging;
pub mod service;

pub use config::Config;
pub use service::{ImageCache, UpdatedImage};
