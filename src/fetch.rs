use crate::error::{AdError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Outcome of a failed fetch, split by whether retrying can help
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Network trouble, timeouts and server-side errors
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// The resource is missing or the request was rejected
    #[error("fetch rejected: {0}")]
    Permanent(String),
}

/// Retrieves raw bytes for a URL. Wrapper documents, creative assets and
/// tracking pixels all go through this seam.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> std::result::Result<Bytes, FetchError>;
}

/// Fetcher backed by reqwest, with `file://` URLs and local paths read from disk
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdError::AssetUnavailable {
                url: String::new(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self { client })
    }

    async fn fetch_local(path: &Path) -> std::result::Result<Bytes, FetchError> {
        debug!("Reading from local file: {}", path.display());
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FetchError::Permanent(format!("{}: {}", path.display(), e)))
            }
            Err(e) => Err(FetchError::Transient(format!("{}: {}", path.display(), e))),
        }
    }

    async fn fetch_remote(&self, url: &str) -> std::result::Result<Bytes, FetchError> {
        // Short random id to correlate log lines of one request
        let req_id: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();

        let url = url::Url::parse(url).map_err(|e| FetchError::Permanent(format!("{}: {}", url, e)))?;

        debug!("[{}] Fetching from URL: {}", req_id, url);
        let start_time = Instant::now();

        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            debug!("[{}] Request failed after {:?}", req_id, start_time.elapsed());
            classify_reqwest_error(&e)
        })?;

        let status = response.status();
        debug!("[{}] Received {} in {:?}", req_id, status, start_time.elapsed());

        if !status.is_success() {
            let message = format!("{}: HTTP status {}", url, status);
            return if status.is_server_error() || status.as_u16() == 429 || status.as_u16() == 408 {
                Err(FetchError::Transient(message))
            } else {
                Err(FetchError::Permanent(message))
            };
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transient(format!("{}: failed to read body: {}", url, e)))?;

        debug!(
            "[{}] Completed {} bytes in {:?}",
            req_id,
            body.len(),
            start_time.elapsed()
        );

        Ok(body)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> std::result::Result<Bytes, FetchError> {
        if let Some(path) = url.strip_prefix("file://") {
            return Self::fetch_local(Path::new(path)).await;
        }

        if !url.contains("://") {
            return Self::fetch_local(Path::new(url)).await;
        }

        self.fetch_remote(url).await
    }
}

fn classify_reqwest_error(error: &reqwest::Error) -> FetchError {
    if error.is_builder() || error.is_redirect() {
        FetchError::Permanent(error.to_string())
    } else {
        FetchError::Transient(error.to_string())
    }
}
