//! Retry policy and HTTP status classification.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Bounded exponential backoff with jitter.
///
/// Delay before retry `n` (0-based) is
/// `base * min(2^n, backoff_cap) * jitter`, jitter drawn from
/// `[jitter_min, jitter_max)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_cap: u32,
    pub jitter_min: f64,
    pub jitter_max: f64,
    /// Upper bound on a server-supplied `Retry-After`.
    pub max_retry_after_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            backoff_cap: 16,
            jitter_min: 0.4,
            jitter_max: 1.3,
            max_retry_after_secs: 120,
        }
    }
}

impl RetryPolicy {
    /// No sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_retry_after_secs: 0,
            ..Self::default()
        }
    }

    pub fn backoff_delay(&self, retry: u32, jitter: f64) -> Duration {
        let factor = 2u64
            .checked_pow(retry)
            .unwrap_or(u64::MAX)
            .min(u64::from(self.backoff_cap.max(1)));
        let ms = self.base_delay_ms as f64 * factor as f64 * jitter.max(0.0);
        Duration::from_millis(ms.round() as u64)
    }

    /// Server hint, capped.
    pub fn retry_after_delay(&self, hint: Duration) -> Duration {
        hint.min(Duration::from_secs(self.max_retry_after_secs))
    }

    pub fn draw_jitter(&self) -> f64 {
        use rand::Rng;
        if self.jitter_max > self.jitter_min {
            rand::thread_rng().gen_range(self.jitter_min..self.jitter_max)
        } else {
            self.jitter_min
        }
    }
}

/// What to do with a non-success status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Back off and retry.
    Retry,
    /// Retry, honoring the server's `Retry-After` when given.
    RetryAfter,
    /// Surface immediately.
    FailFast,
}

/// Status-code classification table.
///
/// Defaults: 429 → `RetryAfter`, 5xx → `Retry`, everything else → `FailFast`.
/// Individual codes can be overridden.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusPolicy {
    pub overrides: BTreeMap<u16, Disposition>,
}

impl StatusPolicy {
    pub fn with_override(mut self, status: u16, disposition: Disposition) -> Self {
        self.overrides.insert(status, disposition);
        self
    }

    pub fn classify(&self, status: u16) -> Disposition {
        if let Some(d) = self.overrides.get(&status) {
            return *d;
        }
        match status {
            429 => Disposition::RetryAfter,
            500..=599 => Disposition::Retry,
            _ => Disposition::FailFast,
        }
    }
}
