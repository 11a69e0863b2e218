//! Per-host admission control.
//!
//! Everything that decides *whether and when* a request may proceed
//! lives here, grouped by throttling key:
//!
//! - [`HostKey`]: canonical throttling-domain identifier, with
//!   [`HostGroups`] collapsing CDN families into shared keys
//! - [`RateGovernor`]: bounded token bucket with slow-start and
//!   adaptive rate control
//! - [`CircuitBreaker`]: failure-triggered CLOSED/OPEN/HALF_OPEN gate
//! - [`HostPool`]: lazily built map of per-host state, the only
//!   mutation path for governors and breakers
//! - configuration types for all of the above

mod breaker;
mod bucket;
mod config;
mod headers;
mod key;
mod pool;

pub use breaker::{BreakerSnapshot, CircuitBreaker};
pub use bucket::{Feedback, GovernorSnapshot, RateGovernor};
pub use config::{BreakerConfig, Concurrency, HostConfig, HostOverrides, RateLimitConfig, ThrottleConfig};
pub use headers::retry_after_hint;
pub use key::{HostGroup, HostGroups, HostKey};
pub use pool::{HostEntry, HostPool};
