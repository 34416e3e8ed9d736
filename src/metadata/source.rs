// src/metadata/source.rs
use std::time::Duration;

use reqwest::header::ACCEPT;
use serde_json::Value;

/// Default bound for one metadata fetch, body included.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a poll produced no new record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("upstream unreachable: {0}")]
    Unreachable(String),
    #[error("upstream returned HTTP {0}")]
    Status(u16),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Anything that can hand the poller one raw status document.
#[async_trait::async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch(&self) -> Result<Value, PollError>;
    fn describe(&self) -> String;
}

/// Status endpoint reached over HTTP(S).
pub struct HttpMetadataSource {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpMetadataSource {
    pub fn new(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
            timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn classify(&self, e: reqwest::Error) -> PollError {
        if e.is_timeout() {
            PollError::Timeout(self.timeout)
        } else if e.is_body() || e.is_decode() {
            PollError::Malformed(e.to_string())
        } else {
            PollError::Unreachable(e.to_string())
        }
    }
}

#[async_trait::async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn fetch(&self) -> Result<Value, PollError> {
        let resp = self
            .client
            .get(&self.url)
            .header(ACCEPT, "application/json, */*")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PollError::Status(status.as_u16()));
        }

        // Servers mislabel JSON (text/html, text/plain); ignore Content-Type.
        let body = resp.bytes().await.map_err(|e| self.classify(e))?;
        serde_json::from_slice(&body).map_err(|e| PollError::Malformed(e.to_string()))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
