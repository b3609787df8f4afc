//! HTTP transport seam.
//!
//! The sender only needs "POST these bytes, give me the status and the `Date`
//! header". Keeping that behind a trait lets tests script responses without a
//! network.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::DATE;
use thiserror::Error;

/// Errors raised before an HTTP status was received.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection, TLS or timeout failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Any other I/O-level failure.
    #[error("transport failed: {0}")]
    Io(String),
}

/// What the sender needs from a response. The body is never surfaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    /// Raw `Date` header, if present.
    pub date: Option<String>,
}

impl TransportResponse {
    pub fn new(status: u16) -> Self {
        Self { status, date: None }
    }

    pub fn with_date(mut self, date: impl Into<String>) -> Self {
        self.date = Some(date.into());
        self
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        headers: Vec<(&'static str, String)>,
        body: Vec<u8>,
    ) -> Result<TransportResponse, TransportError>;
}

/// [`Transport`] backed by a shared `reqwest::Client`.
pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post(
        &self,
        url: &str,
        headers: Vec<(&'static str, String)>,
        body: Vec<u8>,
    ) -> Result<TransportResponse, TransportError> {
        let mut request = self.http.post(url).body(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let date = response
            .headers()
            .get(DATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // Drain so the connection can be reused.
        let _ = response.bytes().await;

        Ok(TransportResponse { status, date })
    }
}
