//! Network seam shared by the cache manager and the relay poller.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use url::Url;

use crate::cache::Resource;

/// Issues GET requests.
///
/// Any HTTP response, whatever its status, is `Ok`. `Err` means the request never
/// produced a response (DNS, connect, TLS or body transport failure).
pub trait Network: Send + Sync + 'static {
  fn fetch(&self, url: &Url) -> impl Future<Output = Result<Resource>> + Send;
}

/// reqwest-backed network client.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  async fn fetch(&self, url: &Url) -> Result<Resource> {
    let response = self
      .client
      .get(url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", url, e))?;

    tracing::debug!(%url, status, bytes = body.len(), "fetched");

    Ok(Resource {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}
