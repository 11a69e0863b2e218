use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default steady-state token rate per host (tokens per second)
const DEFAULT_TARGET_RATE: f64 = 1.0;

/// Default burst capacity per host (tokens)
const DEFAULT_CAPACITY: f64 = 2.0;

/// Default slow-start window
const DEFAULT_RAMP_WINDOW: Duration = Duration::from_secs(15);

/// Default concurrent requests per host
const DEFAULT_PER_HOST_CONCURRENCY: usize = 2;

/// Tuning knobs for the per-host rate governor.
///
/// The multipliers are policy values, not structural requirements; all
/// of them are exposed here rather than hard-coded so deployments can
/// tune them against the hosts they actually talk to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThrottleConfig {
    /// Steady-state refill rate (tokens per second)
    pub target_rate: f64,

    /// Maximum burst size (tokens)
    pub capacity: f64,

    /// Length of the slow-start ramp after a governor is created
    #[serde(with = "humantime_serde")]
    pub ramp_window: Duration,

    /// Fraction of the current rate in effect at the start of the ramp
    pub ramp_start_fraction: f64,

    /// Multiplier applied to the current rate after a success streak
    pub success_increase_factor: f64,

    /// Consecutive successes required before the rate is nudged up
    pub success_streak: u32,

    /// Multiplier applied to the current rate on a throttling signal
    pub throttle_decrease_factor: f64,

    /// Multiplier applied to the current rate on other errors
    /// (1.0 disables the error nudge entirely)
    pub error_decrease_factor: f64,

    /// Lower bound for the current rate, as a fraction of `target_rate`
    pub rate_floor_fraction: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            target_rate: DEFAULT_TARGET_RATE,
            capacity: DEFAULT_CAPACITY,
            ramp_window: DEFAULT_RAMP_WINDOW,
            ramp_start_fraction: 0.2,
            success_increase_factor: 1.1,
            success_streak: 3,
            throttle_decrease_factor: 0.5,
            error_decrease_factor: 0.9,
            rate_floor_fraction: 0.1,
        }
    }
}

impl ThrottleConfig {
    /// The absolute lower bound for the adaptive rate
    #[must_use]
    pub fn rate_floor(&self) -> f64 {
        self.target_rate * self.rate_floor_fraction
    }
}

/// Tuning knobs for the per-host circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker from CLOSED to OPEN
    pub failure_threshold: u32,

    /// Cooldown after the first trip
    #[serde(with = "humantime_serde")]
    pub base_cooldown: Duration,

    /// Upper bound for the cooldown as it doubles on repeated trips
    #[serde(with = "humantime_serde")]
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(900),
        }
    }
}

/// Global rate-limiting defaults, applied to every host that has no
/// entry in the per-host override map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Maximum concurrent requests per host
    #[serde(rename = "per_host_concurrency")]
    pub concurrency: Concurrency,

    /// Governor defaults
    pub throttle: ThrottleConfig,

    /// Breaker defaults
    pub breaker: BreakerConfig,
}

/// Newtype so the per-host concurrency default can live in serde
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Concurrency(
    /// Number of permits
    pub usize,
);

impl Default for Concurrency {
    fn default() -> Self {
        Self(DEFAULT_PER_HOST_CONCURRENCY)
    }
}

/// Per-host configuration overrides, keyed by host key string
pub type HostOverrides = HashMap<String, HostConfig>;

/// Overrides for a specific host's throttling behavior.
/// Unset fields fall back to the global [`RateLimitConfig`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Maximum concurrent requests to this host
    pub concurrency: Option<usize>,

    /// Steady-state refill rate for this host
    pub target_rate: Option<f64>,

    /// Burst capacity for this host
    pub capacity: Option<f64>,
}

impl HostConfig {
    /// Effective concurrency for this host
    #[must_use]
    pub fn effective_concurrency(&self, global: &RateLimitConfig) -> usize {
        self.concurrency.unwrap_or(global.concurrency.0).max(1)
    }

    /// Effective governor config for this host
    #[must_use]
    pub fn effective_throttle(&self, global: &RateLimitConfig) -> ThrottleConfig {
        let mut throttle = global.throttle;
        if let Some(rate) = self.target_rate {
            throttle.target_rate = rate;
        }
        if let Some(capacity) = self.capacity {
            throttle.capacity = capacity;
        }
        throttle
    }
}
