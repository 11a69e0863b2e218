use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use super::breaker::CircuitBreaker;
use super::bucket::{Feedback, RateGovernor};
use super::config::{HostOverrides, RateLimitConfig};
use super::key::HostKey;
use crate::persist::{HostState, PersistedState};
use crate::types::Outcome;

/// All throttling state for one host key: the rate governor, the
/// circuit breaker, and the per-host concurrency slots.
#[derive(Debug)]
pub struct HostEntry {
    /// The key this entry throttles
    pub key: HostKey,
    /// Adaptive token bucket
    pub governor: RateGovernor,
    /// Failure-triggered request gate
    pub breaker: CircuitBreaker,
    /// Per-host concurrency limit, sized independently of the global
    /// pool so one host cannot monopolize it
    pub slots: Arc<Semaphore>,
}

/// Owns the per-host throttling state for one engine instance.
///
/// Entries are created lazily on first access with the global defaults
/// (or the host's override), and are only ever mutated through
/// [`report`](Self::report) — workers themselves never touch governor
/// or breaker state directly.
///
/// There are no ambient globals here: multiple pools, and therefore
/// multiple independent engines, can coexist in one process.
#[derive(Debug)]
pub struct HostPool {
    hosts: DashMap<HostKey, Arc<HostEntry>>,
    config: RateLimitConfig,
    overrides: HostOverrides,
}

impl HostPool {
    /// Create an empty pool with the given defaults and overrides
    #[must_use]
    pub fn new(config: RateLimitConfig, overrides: HostOverrides) -> Self {
        Self {
            hosts: DashMap::new(),
            config,
            overrides,
        }
    }

    /// Get or lazily create the entry for `key`
    #[must_use]
    pub fn entry(&self, key: &HostKey) -> Arc<HostEntry> {
        if let Some(entry) = self.hosts.get(key) {
            return entry.clone();
        }

        let host_config = self.overrides.get(key.as_str()).cloned().unwrap_or_default();
        let entry = Arc::new(HostEntry {
            key: key.clone(),
            governor: RateGovernor::new(key.clone(), host_config.effective_throttle(&self.config)),
            breaker: CircuitBreaker::new(key.clone(), self.config.breaker),
            slots: Arc::new(Semaphore::new(host_config.effective_concurrency(&self.config))),
        });

        // another worker may have created the entry in the meantime;
        // whoever wins the race, everyone uses the same instance
        match self.hosts.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => existing.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(vacant) => vacant.insert(entry).clone(),
        }
    }

    /// Feed a completed attempt's outcome into the host's governor and
    /// breaker. This is the only mutation path for throttling state.
    ///
    /// Fatal outcomes carry no feedback: a 404 says nothing about the
    /// host's capacity or health.
    pub fn report(&self, key: &HostKey, outcome: &Outcome) {
        let entry = self.entry(key);
        match outcome {
            Outcome::Success { .. } => {
                entry.governor.report(Feedback::Success);
                entry.breaker.report(true);
            }
            Outcome::Throttled { retry_after, .. } => {
                entry.governor.report(Feedback::Throttled);
                if let Some(hint) = retry_after {
                    entry.governor.pause_until(Instant::now() + *hint);
                }
                entry.breaker.report(false);
            }
            Outcome::Transient { .. } => {
                entry.governor.report(Feedback::Error);
                entry.breaker.report(false);
            }
            Outcome::Fatal { .. } => {}
        }
    }

    /// Snapshot every host's governor and breaker state for persistence
    #[must_use]
    pub fn snapshot(&self) -> PersistedState {
        let hosts: HashMap<HostKey, HostState> = self
            .hosts
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    HostState {
                        governor: entry.governor.snapshot(),
                        breaker: entry.breaker.snapshot(),
                    },
                )
            })
            .collect();
        PersistedState::now(hosts)
    }

    /// Restore governor and breaker state from a prior run's snapshot.
    ///
    /// Entries are created on demand; hosts in the snapshot that this
    /// run never touches simply carry their state forward to the next
    /// save.
    pub fn restore(&self, state: &PersistedState) {
        for (key, host_state) in &state.hosts {
            let entry = self.entry(key);
            entry.governor.restore(&host_state.governor);
            entry.breaker.restore(&host_state.breaker);
        }
        if !state.hosts.is_empty() {
            log::info!("Restored throttling state for {} host(s)", state.hosts.len());
        }
    }

    /// Number of hosts with live throttling state
    #[must_use]
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    /// Remaining cooldown for `key`'s breaker, used to annotate
    /// `HostUnavailable` errors
    #[must_use]
    pub fn breaker_retry_hint(&self, key: &HostKey) -> Option<Duration> {
        self.hosts.get(key).and_then(|entry| entry.breaker.retry_hint())
    }
}
