//! HTTP upstream for configured sources.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::time::Duration;
use url::Url;

/// Fetches one URL and parses the body as JSON.
///
/// The request timeout is the only deadline on the call; breakers wait on
/// their upstream for as long as it takes.
#[derive(Clone, Debug)]
pub struct HttpSource {
  client: reqwest::Client,
  url: Url,
}

impl HttpSource {
  pub fn new(url: &str, timeout: Duration) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid URL {}: {}", url, e))?;
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("feed-breaker/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, url })
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  pub async fn fetch_json(&self) -> Result<Value> {
    let response = self
      .client
      .get(self.url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", self.url, e))?
      .error_for_status()
      .map_err(|e| eyre!("Upstream {} returned an error: {}", self.url, e))?;

    response
      .json::<Value>()
      .await
      .map_err(|e| eyre!("Failed to parse response from {}: {}", self.url, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_rejects_invalid_url() {
    let err = HttpSource::new("::nope", Duration::from_secs(1)).unwrap_err();
    assert!(err.to_string().contains("Invalid URL"));
  }

  #[tokio::test]
  async fn test_unreachable_host_is_an_error() {
    // Bind an ephemeral port, then close it so nothing is listening there
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let url = format!("http://{}/feed", addr);
    let source = HttpSource::new(&url, Duration::from_millis(500)).unwrap();
    let err = source.fetch_json().await.unwrap_err();
    assert!(err.to_string().contains("Request to"));
  }
}
