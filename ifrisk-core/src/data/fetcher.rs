//! Resilient fetcher: one logical GET with retry, backoff and classification.
//!
//! Every upstream call in the pipeline goes through `ResilientFetcher::fetch`.
//! The retry policy, timeout tiers and status table are its only knobs.

use super::retry::{Disposition, RetryPolicy, StatusPolicy};
use super::transport::{HttpResponse, TimeoutTiers, Transport, TransportError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Max characters of a response body carried in an error.
const SNIPPET_CHARS: usize = 300;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("rate limited (HTTP 429)")]
    RateLimited { retry_after: Option<Duration> },

    #[error("server error HTTP {status}: {snippet}")]
    Server { status: u16, snippet: String },

    #[error("malformed response body: {0}")]
    MalformedBody(String),

    #[error("request rejected with HTTP {status}: {snippet}")]
    Permanent { status: u16, snippet: String },

    #[error("gave up on {url} after {attempts} attempts; last error: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        last: Box<FetchError>,
    },
}

impl FetchError {
    /// Non-retryable request error (HTTP 400 and other fail-fast statuses).
    pub fn is_permanent(&self) -> bool {
        matches!(self, FetchError::Permanent { .. })
    }

    /// Whether the last underlying cause was a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            FetchError::Transport(TransportError::Timeout(_)) => true,
            FetchError::Exhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }
}

/// Retrying JSON fetcher over a [`Transport`].
pub struct ResilientFetcher {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    timeouts: TimeoutTiers,
    statuses: StatusPolicy,
}

impl ResilientFetcher {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy, timeouts: TimeoutTiers) -> Self {
        Self {
            transport,
            policy,
            timeouts,
            statuses: StatusPolicy::default(),
        }
    }

    pub fn with_status_policy(mut self, statuses: StatusPolicy) -> Self {
        self.statuses = statuses;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetch `url` with `params` and parse the body as JSON.
    ///
    /// Transient failures are retried up to `max_attempts` times in total;
    /// fail-fast statuses return `FetchError::Permanent` at once. Running out
    /// of attempts returns `FetchError::Exhausted` wrapping the last cause.
    pub fn fetch(&self, url: &str, params: &[(String, String)]) -> Result<Value, FetchError> {
        let attempts = self.policy.max_attempts.max(1);
        let mut last_error: Option<FetchError> = None;

        for attempt in 0..attempts {
            if let Some(err) = &last_error {
                let delay = match err {
                    FetchError::RateLimited {
                        retry_after: Some(hint),
                    } => self.policy.retry_after_delay(*hint),
                    _ => self
                        .policy
                        .backoff_delay(attempt - 1, self.policy.draw_jitter()),
                };
                warn!(
                    url,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying upstream request"
                );
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }

            match self.attempt(url, params) {
                Ok(body) => return Ok(body),
                Err(e) if e.is_permanent() => return Err(e),
                Err(e) => last_error = Some(e),
            }
        }

        let last = last_error.unwrap_or_else(|| FetchError::MalformedBody("no attempt made".into()));
        Err(FetchError::Exhausted {
            url: url.to_string(),
            attempts,
            last: Box::new(last),
        })
    }

    fn attempt(&self, url: &str, params: &[(String, String)]) -> Result<Value, FetchError> {
        let resp = self.transport.get(url, params, &self.timeouts)?;
        debug!(url, status = resp.status, bytes = resp.body.len(), "upstream response");

        if (200..300).contains(&resp.status) {
            return serde_json::from_str(&resp.body)
                .map_err(|e| FetchError::MalformedBody(format!("{e}; body starts: {}", snippet(&resp))));
        }

        match self.statuses.classify(resp.status) {
            Disposition::RetryAfter => Err(FetchError::RateLimited {
                retry_after: resp.retry_after,
            }),
            Disposition::Retry => Err(FetchError::Server {
                status: resp.status,
                snippet: snippet(&resp),
            }),
            Disposition::FailFast => Err(FetchError::Permanent {
                status: resp.status,
                snippet: snippet(&resp),
            }),
        }
    }
}

fn snippet(resp: &HttpResponse) -> String {
    crate::text::truncate_chars(resp.body.trim(), SNIPPET_CHARS)
}
