//! HTTP transport seam.
//!
//! The fetcher talks to a `Transport` so the retry logic can be exercised
//! against scripted responses in tests. `HttpTransport` is the production
//! implementation on top of a blocking reqwest client.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Timeout budgets for one request.
///
/// Upstream latency is dominated by server-side table generation, so the read
/// budget is much larger than the connect and write budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutTiers {
    pub connect_secs: f64,
    pub write_secs: f64,
    pub read_secs: f64,
}

impl Default for TimeoutTiers {
    fn default() -> Self {
        Self {
            connect_secs: 10.0,
            write_secs: 10.0,
            read_secs: 120.0,
        }
    }
}

impl TimeoutTiers {
    /// Same connect/write tiers with a different read budget.
    pub fn with_read_secs(mut self, read_secs: f64) -> Self {
        self.read_secs = read_secs;
        self
    }

    pub fn connect(&self) -> Duration {
        secs(self.connect_secs)
    }

    /// Whole-request deadline once connected: send plus receive.
    pub fn request_deadline(&self) -> Duration {
        secs(self.write_secs) + secs(self.read_secs)
    }
}

fn secs(v: f64) -> Duration {
    if v.is_finite() && v > 0.0 {
        Duration::from_secs_f64(v)
    } else {
        Duration::ZERO
    }
}

/// Status line, `Retry-After` hint and body of one response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl HttpResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            retry_after: None,
            body: body.into(),
        }
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }
}

/// Failures below the HTTP layer. All of them are retryable.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    Other(String),
}

pub trait Transport: Send + Sync {
    /// Issue a GET with the given query parameters.
    fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        timeouts: &TimeoutTiers,
    ) -> Result<HttpResponse, TransportError>;
}

/// Blocking reqwest transport.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(timeouts: &TimeoutTiers) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(timeouts.connect())
            .timeout(timeouts.request_deadline())
            .user_agent(concat!("ifrisk/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        timeouts: &TimeoutTiers,
    ) -> Result<HttpResponse, TransportError> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(timeouts.request_deadline())
            .send()
            .map_err(classify_reqwest_error)?;

        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let body = resp.text().map_err(classify_reqwest_error)?;

        Ok(HttpResponse {
            status,
            retry_after,
            body,
        })
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}
