//! Client for the external content-addressable store.
//!
//! The store is an IPFS-style HTTP API: `POST /add` with a multipart body
//! answers `{"Hash": ...}`, `POST /cat?arg=<hash>` answers the raw bytes.
//! Nothing is cached locally.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use cairn_shared::constants::{
    DEFAULT_STORE_BACKOFF_MS, DEFAULT_STORE_MAX_RETRIES, DEFAULT_STORE_TIMEOUT_SECS,
};

use crate::error::{Result, StoreError};

/// Opaque add/get-by-hash service.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `data` and return its content hash.
    async fn put(&self, data: &[u8]) -> Result<String>;

    /// Fetch the bytes previously stored under `hash`.
    async fn get(&self, hash: &str) -> Result<Vec<u8>>;

    /// Best-effort removal of `hash` from the store's pin set.
    async fn unpin(&self, hash: &str) -> Result<()>;
}

/// Connection settings for [`HttpContentStore`].
#[derive(Debug, Clone)]
pub struct ContentStoreConfig {
    /// Base URL of the API, e.g. `http://127.0.0.1:5001/api/v0`.
    pub base_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Total attempts per call, including the first.
    pub max_retries: u32,
    /// Delay before the second attempt; doubled for each one after.
    pub backoff: Duration,
}

impl Default for ContentStoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5001/api/v0".to_string(),
            timeout: Duration::from_secs(DEFAULT_STORE_TIMEOUT_SECS),
            max_retries: DEFAULT_STORE_MAX_RETRIES,
            backoff: Duration::from_millis(DEFAULT_STORE_BACKOFF_MS),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

#[derive(Debug, Clone)]
pub struct HttpContentStore {
    client: reqwest::Client,
    config: ContentStoreConfig,
}

impl HttpContentStore {
    pub fn new(config: ContentStoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ContentStoreConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Run `call` until it succeeds, fails with a non-transport error, or the
    /// attempt budget is spent.
    async fn with_retries<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.max_retries.max(1);
        let mut attempt = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.config.backoff * 2u32.saturating_pow(attempt);
                    warn!(
                        op,
                        attempt = attempt + 1,
                        of = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Content store call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn add_once(&self, data: &[u8]) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(data.to_vec())
            .file_name("blob")
            .mime_str("application/octet-stream")?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self.client.post(self.url("add")).multipart(form).send().await?;
        let body = checked_body(response).await?;
        let parsed: AddResponse = serde_json::from_slice(&body)?;
        Ok(parsed.hash)
    }

    async fn cat_once(&self, hash: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(self.url("cat"))
            .query(&[("arg", hash)])
            .send()
            .await?;
        checked_body(response).await
    }

    async fn unpin_once(&self, hash: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url("pin/rm"))
            .query(&[("arg", hash)])
            .send()
            .await?;
        checked_body(response).await.map(|_| ())
    }
}

async fn checked_body(response: reqwest::Response) -> Result<Vec<u8>> {
    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(StoreError::NotFound(response.url().to_string()));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(StoreError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.bytes().await?.to_vec())
}

#[async_trait]
impl ContentStore for HttpContentStore {
    async fn put(&self, data: &[u8]) -> Result<String> {
        let hash = self.with_retries("add", || self.add_once(data)).await?;
        debug!(hash = %hash, size = data.len(), "Stored content");
        Ok(hash)
    }

    async fn get(&self, hash: &str) -> Result<Vec<u8>> {
        let data = self.with_retries("cat", || self.cat_once(hash)).await?;
        debug!(hash = %hash, size = data.len(), "Fetched content");
        Ok(data)
    }

    async fn unpin(&self, hash: &str) -> Result<()> {
        self.with_retries("pin/rm", || self.unpin_once(hash)).await
    }
}
