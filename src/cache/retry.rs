//! Exponential backoff with jitter for any async operation.

use color_eyre::{eyre::eyre, Report, Result};
use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Retry policy. Passed by value on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Maximum number of attempts, including the first one
  pub max_attempts: u32,
  /// Delay before the second attempt, in milliseconds
  pub base_delay_ms: u64,
  /// Upper bound for any single delay, in milliseconds
  pub max_delay_ms: u64,
  /// Spread delays by +/- 25% to avoid retry storms
  pub use_jitter: bool,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay_ms: 300,
      max_delay_ms: 5000,
      use_jitter: true,
    }
  }
}

impl RetryConfig {
  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts;
    self
  }

  pub fn without_jitter(mut self) -> Self {
    self.use_jitter = false;
    self
  }
}

/// Delay to wait after the given (1-indexed) failed attempt.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
  let exponent = attempt.saturating_sub(1).min(63);
  let delay = config
    .base_delay_ms
    .saturating_mul(1u64 << exponent)
    .min(config.max_delay_ms) as f64;

  let delay = if config.use_jitter {
    let jitter = delay * 0.25;
    delay - jitter + rand::rng().random_range(0.0..=1.0) * jitter * 2.0
  } else {
    delay
  };

  Duration::from_millis(delay.floor() as u64)
}

/// Run `operation` until it succeeds or `config.max_attempts` is exhausted.
pub async fn with_retry<T, E, F, Fut>(operation: F, config: RetryConfig) -> Result<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = std::result::Result<T, E>>,
  E: Into<Report>,
{
  with_retry_cancellable(operation, config, &CancellationToken::new()).await
}

/// Like [`with_retry`], but stops retrying as soon as `cancel` fires.
pub async fn with_retry_cancellable<T, E, F, Fut>(
  mut operation: F,
  config: RetryConfig,
  cancel: &CancellationToken,
) -> Result<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = std::result::Result<T, E>>,
  E: Into<Report>,
{
  let max_attempts = config.max_attempts.max(1);
  let mut last_error: Option<Report> = None;

  for attempt in 1..=max_attempts {
    if cancel.is_cancelled() {
      return Err(cancelled(last_error));
    }

    match operation().await {
      Ok(value) => return Ok(value),
      Err(e) => {
        let e = e.into();
        debug!("Attempt {}/{} failed: {}", attempt, max_attempts, e);
        last_error = Some(e);
      }
    }

    // No delay after the final attempt
    if attempt >= max_attempts {
      break;
    }

    let delay = calculate_backoff(attempt, &config);
    tokio::select! {
      _ = cancel.cancelled() => return Err(cancelled(last_error)),
      _ = tokio::time::sleep(delay) => {}
    }
  }

  Err(last_error.unwrap_or_else(|| eyre!("All retry attempts failed")))
}

fn cancelled(last_error: Option<Report>) -> Report {
  match last_error {
    Some(e) => e.wrap_err("Retry cancelled"),
    None => eyre!("Retry cancelled"),
  }
}
