//! Retry budget and backoff policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Smallest delay ever slept between attempts; keeps jittered delays
/// from rounding down to a busy retry
const MIN_BACKOFF: Duration = Duration::from_millis(50);

/// Retry and backoff configuration.
///
/// One budget of `max_retries` attempts applies per URL, shared across
/// all failure kinds (throttled, transient, breaker-open).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Maximum attempts per URL before it is reported as failed
    pub max_retries: u32,

    /// Backoff before the second attempt; doubles per attempt
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound for the exponential backoff
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Fraction of random inflation applied to computed delays
    /// (`delay * (1 + jitter_fraction * random_unit)`)
    pub jitter_fraction: f64,

    /// Upper bound applied to server `Retry-After` hints, so a
    /// misbehaving host cannot park a worker for an hour
    #[serde(with = "humantime_serde")]
    pub max_retry_after: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_fraction: 0.2,
            max_retry_after: Duration::from_secs(300),
        }
    }
}

impl RetryConfig {
    /// The delay to sleep before the attempt after `attempt` (1-based)
    /// failed.
    ///
    /// A server-provided `Retry-After` hint overrides the exponential
    /// formula exactly — no jitter — clamped only by `max_retry_after`.
    #[must_use]
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max_retry_after);
        }
        let exponent = attempt.saturating_sub(1).min(20);
        let exponential = self
            .base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay);
        let jitter = 1.0 + self.jitter_fraction * rand::random::<f64>();
        exponential.mul_f64(jitter).max(MIN_BACKOFF)
    }

    /// Whether another attempt remains after `attempt` (1-based) failed
    #[must_use]
    pub const fn attempts_remain(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}
