use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::config::BreakerConfig;
use super::key::HostKey;

/// Per-host circuit breaker.
///
/// CLOSED passes requests through and counts consecutive failures; at
/// the configured threshold the breaker trips to OPEN and rejects
/// everything until the cooldown expires. The first
/// [`allow`](Self::allow) after expiry claims the single HALF_OPEN
/// trial slot under the state lock, so concurrent callers can never
/// start two trials. The trial outcome is authoritative: success closes
/// the breaker and resets the cooldown to its base value, failure
/// re-opens it with the cooldown doubled up to the configured cap.
#[derive(Debug)]
pub struct CircuitBreaker {
    key: HostKey,
    config: BreakerConfig,
    state: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    circuit: Circuit,
    /// Cooldown to apply on the next trip; grows across consecutive
    /// trips and resets on recovery
    cooldown: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Circuit {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
    /// The single post-cooldown trial has been claimed and its outcome
    /// is pending
    HalfOpen,
}

/// Serializable snapshot of a breaker's state.
///
/// A HALF_OPEN breaker snapshots as OPEN with no remaining cooldown:
/// the in-flight trial cannot survive a restart, and restoring to
/// "cooldown already expired" re-admits exactly one trial, which is the
/// same observable behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BreakerSnapshot {
    /// Breaker was closed
    Closed {
        /// Failures counted so far
        consecutive_failures: u32,
        /// Cooldown the next trip would apply
        #[serde(with = "humantime_serde")]
        cooldown: Duration,
    },
    /// Breaker was open
    Open {
        /// Cooldown still to serve at snapshot time
        #[serde(with = "humantime_serde")]
        remaining: Duration,
        /// Full cooldown of the current trip
        #[serde(with = "humantime_serde")]
        cooldown: Duration,
    },
}

impl CircuitBreaker {
    /// Create a closed breaker for `key`
    #[must_use]
    pub fn new(key: HostKey, config: BreakerConfig) -> Self {
        Self {
            key,
            config,
            state: Mutex::new(Inner {
                circuit: Circuit::Closed {
                    consecutive_failures: 0,
                },
                cooldown: config.base_cooldown,
            }),
        }
    }

    /// Whether a request to this host may proceed right now.
    ///
    /// Non-blocking. Returns `false` while OPEN before cooldown expiry
    /// and while a HALF_OPEN trial is pending. The OPEN to HALF_OPEN
    /// transition happens here, under the lock, claiming the trial for
    /// the caller that observed `true`.
    #[must_use]
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.circuit {
            Circuit::Closed { .. } => true,
            Circuit::Open { opened_at } => {
                if opened_at.elapsed() >= state.cooldown {
                    log::debug!("Breaker '{}' half-open, admitting trial", self.key);
                    state.circuit = Circuit::HalfOpen;
                    true
                } else {
                    false
                }
            }
            Circuit::HalfOpen => false,
        }
    }

    /// Remaining cooldown, if the breaker is currently open
    #[must_use]
    pub fn retry_hint(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        match state.circuit {
            Circuit::Open { opened_at } => {
                Some(state.cooldown.saturating_sub(opened_at.elapsed()))
            }
            Circuit::Closed { .. } | Circuit::HalfOpen => None,
        }
    }

    /// Record the outcome of a completed attempt
    pub fn report(&self, success: bool) {
        let mut state = self.state.lock().unwrap();
        match (state.circuit, success) {
            (Circuit::Closed { .. }, true) => {
                state.circuit = Circuit::Closed {
                    consecutive_failures: 0,
                };
            }
            (Circuit::Closed { consecutive_failures }, false) => {
                let failures = consecutive_failures + 1;
                if failures >= self.config.failure_threshold {
                    log::warn!(
                        "Breaker '{}' opened after {failures} consecutive failures (cooldown {:?})",
                        self.key,
                        state.cooldown
                    );
                    state.circuit = Circuit::Open {
                        opened_at: Instant::now(),
                    };
                } else {
                    state.circuit = Circuit::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            (Circuit::HalfOpen, true) => {
                log::info!("Breaker '{}' trial succeeded, closing", self.key);
                state.circuit = Circuit::Closed {
                    consecutive_failures: 0,
                };
                state.cooldown = self.config.base_cooldown;
            }
            (Circuit::HalfOpen, false) => {
                state.cooldown = (state.cooldown * 2).min(self.config.max_cooldown);
                log::warn!(
                    "Breaker '{}' trial failed, re-opening (cooldown {:?})",
                    self.key,
                    state.cooldown
                );
                state.circuit = Circuit::Open {
                    opened_at: Instant::now(),
                };
            }
            // Attempts that were already in flight when the breaker
            // opened report here; the open state is authoritative
            (Circuit::Open { .. }, _) => {}
        }
    }

    /// Pure read of the breaker state
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.lock().unwrap();
        match state.circuit {
            Circuit::Closed { consecutive_failures } => BreakerSnapshot::Closed {
                consecutive_failures,
                cooldown: state.cooldown,
            },
            Circuit::Open { opened_at } => BreakerSnapshot::Open {
                remaining: state.cooldown.saturating_sub(opened_at.elapsed()),
                cooldown: state.cooldown,
            },
            Circuit::HalfOpen => BreakerSnapshot::Open {
                remaining: Duration::ZERO,
                cooldown: state.cooldown,
            },
        }
    }

    /// Overwrite the breaker state from a snapshot
    pub fn restore(&self, snapshot: &BreakerSnapshot) {
        let mut state = self.state.lock().unwrap();
        match snapshot {
            BreakerSnapshot::Closed {
                consecutive_failures,
                cooldown,
            } => {
                state.circuit = Circuit::Closed {
                    consecutive_failures: *consecutive_failures,
                };
                state.cooldown = (*cooldown).min(self.config.max_cooldown);
            }
            BreakerSnapshot::Open { remaining, cooldown } => {
                state.cooldown = (*cooldown).min(self.config.max_cooldown);
                // re-open so that `remaining` is what's left to serve
                let already_served = state.cooldown.saturating_sub(*remaining);
                let opened_at = Instant::now()
                    .checked_sub(already_served)
                    .unwrap_or_else(Instant::now);
                state.circuit = Circuit::Open { opened_at };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn breaker(threshold: u32, base: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            HostKey::from("h"),
            BreakerConfig {
                failure_threshold: threshold,
                base_cooldown: base,
                max_cooldown: Duration::from_secs(600),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_exact_threshold() {
        let breaker = breaker(3, Duration::from_secs(60));
        breaker.report(false);
        breaker.report(false);
        assert!(breaker.allow(), "still closed after threshold - 1 failures");
        breaker.report(false);
        assert!(!breaker.allow(), "open after the 3rd consecutive failure");
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let breaker = breaker(3, Duration::from_secs(60));
        breaker.report(false);
        breaker.report(false);
        breaker.report(true);
        breaker.report(false);
        breaker.report(false);
        assert!(breaker.allow(), "streak was broken by the success");
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_cooldown() {
        let breaker = breaker(1, Duration::from_secs(60));
        breaker.report(false);
        assert!(!breaker.allow());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(breaker.allow(), "cooldown expired, trial admitted");
        assert!(!breaker.allow(), "second caller must not get a trial");
        assert!(!breaker.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_success_closes() {
        let breaker = breaker(1, Duration::from_secs(60));
        breaker.report(false);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(breaker.allow());
        breaker.report(true);
        assert!(breaker.allow(), "closed again after trial success");
        match breaker.snapshot() {
            BreakerSnapshot::Closed {
                consecutive_failures,
                cooldown,
            } => {
                assert_eq!(consecutive_failures, 0);
                assert_eq!(cooldown, Duration::from_secs(60));
            }
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_failure_doubles_cooldown_up_to_cap() {
        let breaker = breaker(1, Duration::from_secs(60));
        breaker.report(false);
        for expected_secs in [120, 240, 480, 600, 600] {
            tokio::time::advance(Duration::from_secs(601)).await;
            assert!(breaker.allow());
            breaker.report(false);
            match breaker.snapshot() {
                BreakerSnapshot::Open { cooldown, .. } => {
                    assert_eq!(cooldown, Duration::from_secs(expected_secs));
                }
                other => panic!("expected Open, got {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_get_exactly_one_trial() {
        let breaker = Arc::new(breaker(1, Duration::from_secs(1)));
        breaker.report(false);
        tokio::time::advance(Duration::from_secs(2)).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let breaker = breaker.clone();
            handles.push(tokio::spawn(async move { breaker.allow() }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_while_open_is_ignored() {
        let breaker = breaker(1, Duration::from_secs(60));
        breaker.report(false);
        // a straggler attempt that was in flight when the breaker opened
        breaker.report(true);
        assert!(!breaker.allow(), "late success must not close an open breaker");
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_restore_round_trip() {
        let breaker_a = breaker(2, Duration::from_secs(60));
        breaker_a.report(false);
        breaker_a.report(false); // open
        tokio::time::advance(Duration::from_secs(10)).await;

        let snapshot = breaker_a.snapshot();
        let breaker_b = breaker(2, Duration::from_secs(60));
        breaker_b.restore(&snapshot);
        assert_eq!(breaker_b.snapshot(), snapshot);
        assert!(!breaker_b.allow());

        tokio::time::advance(Duration::from_secs(51)).await;
        assert!(breaker_b.allow(), "restored breaker serves only the remaining cooldown");
    }

    #[test]
    fn test_snapshot_serde_round_trip() {
        let snapshot = BreakerSnapshot::Open {
            remaining: Duration::from_secs(12),
            cooldown: Duration::from_secs(120),
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: BreakerSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snapshot, parsed);
    }
}
