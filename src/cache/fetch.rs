//! Network retrieval of image payloads.

use color_eyre::{eyre::eyre, Result};
use reqwest::header::ACCEPT;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::FetchConfig;

const IMAGE_ACCEPT: &str = "image/webp,image/png,image/jpeg,image/gif,image/*";

/// HTTP client for image downloads.
#[derive(Clone)]
pub struct HttpFetcher {
  client: Client,
}

impl HttpFetcher {
  pub fn new(config: &FetchConfig) -> Result<Self> {
    let client = Client::builder()
      .timeout(Duration::from_millis(config.request_timeout_ms))
      .user_agent(&config.user_agent)
      .gzip(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  /// Download `url`. Non-success statuses are errors.
  pub async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
    let parsed = Url::parse(url).map_err(|e| eyre!("Invalid image URL {}: {}", url, e))?;
    if !matches!(parsed.scheme(), "http" | "https") {
      return Err(eyre!("Unsupported URL scheme for {}", url));
    }

    let response = self
      .client
      .get(parsed)
      .header(ACCEPT, IMAGE_ACCEPT)
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("HTTP {} for {}", status, url));
    }

    let bytes = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", url, e))?;

    debug!("Fetched {} bytes from {}", bytes.len(), url);
    Ok(bytes.to_vec())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_fetch_success() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("GET", "/hero.webp")
      .with_status(200)
      .with_body(b"RIFF-webp")
      .create_async()
      .await;

    let fetcher = HttpFetcher::new(&FetchConfig::default()).unwrap();
    let body = fetcher
      .fetch(&format!("{}/hero.webp", server.url()))
      .await
      .unwrap();

    assert_eq!(body, b"RIFF-webp");
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn test_fetch_non_success_is_error() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
      .mock("GET", "/missing.webp")
      .with_status(404)
      .create_async()
      .await;

    let fetcher = HttpFetcher::new(&FetchConfig::default()).unwrap();
    let err = fetcher
      .fetch(&format!("{}/missing.webp", server.url()))
      .await
      .unwrap_err();

    assert!(err.to_string().contains("404"));
  }

  #[tokio::test]
  async fn test_fetch_rejects_non_http() {
    let fetcher = HttpFetcher::new(&FetchConfig::default()).unwrap();
    assert!(fetcher.fetch("file:///etc/passwd").await.is_err());
    assert!(fetcher.fetch("not a url").await.is_err());
  }
}
