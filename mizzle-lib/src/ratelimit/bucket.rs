use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};

use super::config::ThrottleConfig;
use super::key::HostKey;

/// Outcome feedback the governor understands.
///
/// Reported by the engine after each attempt fully completes; the
/// governor never observes responses directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    /// The attempt succeeded; count towards a rate increase
    Success,
    /// The host signalled throttling; cut the rate immediately
    Throttled,
    /// The attempt failed for another reason; small downward nudge
    Error,
}

/// Per-host bounded token bucket with slow-start and adaptive rate
/// control.
///
/// Tokens accumulate lazily at `current_rate * ramp_fraction` tokens per
/// second, capped at `capacity`; [`acquire`](Self::acquire) suspends
/// until one token is available and debits exactly one. All grants go
/// through a single mutex over the bucket state, so two acquirers can
/// never debit the same token.
///
/// The effective rate starts at a configured fraction of `current_rate`
/// and ramps linearly to the full rate over the ramp window. After the
/// window, [`report`](Self::report) feedback steers `current_rate`
/// between the configured floor and `target_rate`.
#[derive(Debug)]
pub struct RateGovernor {
    key: HostKey,
    config: ThrottleConfig,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    capacity: f64,
    tokens: f64,
    target_rate: f64,
    current_rate: f64,
    ramp_start: Instant,
    last_refill: Instant,
    paused_until: Option<Instant>,
    streak: u32,
}

/// Serializable snapshot of a governor's adaptive state.
///
/// `Instant`s are replaced by the elapsed ramp offset so the snapshot
/// survives a process restart: on restore the ramp resumes from the
/// same position rather than starting over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorSnapshot {
    /// Maximum burst size
    pub capacity: f64,
    /// Tokens available at snapshot time
    pub tokens: f64,
    /// Configured steady-state rate
    pub target_rate: f64,
    /// Adaptively adjusted rate
    pub current_rate: f64,
    /// Time spent in the slow-start ramp so far
    #[serde(with = "humantime_serde")]
    pub ramp_elapsed: Duration,
}

/// Effective rates below this are clamped to keep refill arithmetic and
/// wait-time division well-defined
const MIN_EFFECTIVE_RATE: f64 = 1e-3;

impl BucketState {
    fn new(config: &ThrottleConfig, now: Instant) -> Self {
        Self {
            capacity: config.capacity.max(1.0),
            // one token up front so the first request per host does not
            // stall for a full refill interval
            tokens: 1.0_f64.min(config.capacity.max(1.0)),
            target_rate: config.target_rate,
            current_rate: config.target_rate,
            ramp_start: now,
            last_refill: now,
            paused_until: None,
            streak: 0,
        }
    }

    /// Slow-start multiplier in `[ramp_start_fraction, 1.0]`
    fn ramp_fraction(&self, now: Instant, config: &ThrottleConfig) -> f64 {
        if config.ramp_window.is_zero() {
            return 1.0;
        }
        let elapsed = now.saturating_duration_since(self.ramp_start);
        let progress = (elapsed.as_secs_f64() / config.ramp_window.as_secs_f64()).min(1.0);
        let start = config.ramp_start_fraction.clamp(0.0, 1.0);
        start + (1.0 - start) * progress
    }

    fn effective_rate(&self, now: Instant, config: &ThrottleConfig) -> f64 {
        (self.current_rate * self.ramp_fraction(now, config)).max(MIN_EFFECTIVE_RATE)
    }

    fn refill(&mut self, now: Instant, config: &ThrottleConfig) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let refill = elapsed.as_secs_f64() * self.effective_rate(now, config);
        self.tokens = (self.tokens + refill).min(self.capacity);
        self.last_refill = now;
    }

    fn rate_floor(&self, config: &ThrottleConfig) -> f64 {
        (self.target_rate * config.rate_floor_fraction).max(MIN_EFFECTIVE_RATE)
    }
}

impl RateGovernor {
    /// Create a governor for `key` with the ramp starting now
    #[must_use]
    pub fn new(key: HostKey, config: ThrottleConfig) -> Self {
        log::debug!(
            "Created governor for '{key}': target={}/s, capacity={}, ramp={:?}",
            config.target_rate,
            config.capacity,
            config.ramp_window
        );
        Self {
            key,
            config,
            state: Mutex::new(BucketState::new(&config, Instant::now())),
        }
    }

    /// Suspend until one token is available, then debit it.
    ///
    /// Cancel-safe: dropping the future between sleeps never debits a
    /// token.
    pub async fn acquire(&self) {
        loop {
            match self.try_take() {
                None => {
                    log::trace!("Governor '{}' granted token", self.key);
                    return;
                }
                Some(wait) => sleep(wait).await,
            }
        }
    }

    /// One grant attempt: `None` means a token was debited, `Some(d)`
    /// means the caller should wait `d` and try again.
    fn try_take(&self) -> Option<Duration> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        if let Some(deadline) = state.paused_until {
            if now < deadline {
                return Some(deadline - now);
            }
            state.paused_until = None;
        }
        state.refill(now, &self.config);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return None;
        }
        let deficit = 1.0 - state.tokens;
        let rate = state.effective_rate(now, &self.config);
        Some(Duration::from_secs_f64(deficit / rate))
    }

    /// Feed an attempt outcome back into the adaptive rate
    pub fn report(&self, feedback: Feedback) {
        let mut state = self.state.lock().unwrap();
        let floor = state.rate_floor(&self.config);
        match feedback {
            Feedback::Success => {
                state.streak += 1;
                if state.streak >= self.config.success_streak {
                    state.streak = 0;
                    let raised =
                        (state.current_rate * self.config.success_increase_factor).min(state.target_rate);
                    if raised > state.current_rate {
                        log::debug!(
                            "Governor '{}' rate raised {:.3} -> {:.3}",
                            self.key,
                            state.current_rate,
                            raised
                        );
                    }
                    state.current_rate = raised;
                }
            }
            Feedback::Throttled => {
                state.streak = 0;
                let lowered = (state.current_rate * self.config.throttle_decrease_factor).max(floor);
                log::info!(
                    "Governor '{}' throttled, rate cut {:.3} -> {:.3}",
                    self.key,
                    state.current_rate,
                    lowered
                );
                state.current_rate = lowered;
            }
            Feedback::Error => {
                state.streak = 0;
                state.current_rate = (state.current_rate * self.config.error_decrease_factor).max(floor);
            }
        }
    }

    /// Block grants until `deadline`, honoring a server `Retry-After`
    /// hint. Only ever extends an existing pause.
    pub fn pause_until(&self, deadline: Instant) {
        let mut state = self.state.lock().unwrap();
        if state.paused_until.map_or(true, |current| deadline > current) {
            log::info!(
                "Governor '{}' paused for {:?}",
                self.key,
                deadline.saturating_duration_since(Instant::now())
            );
            state.paused_until = Some(deadline);
        }
    }

    /// Pure read of the adaptive state
    #[must_use]
    pub fn snapshot(&self) -> GovernorSnapshot {
        let state = self.state.lock().unwrap();
        GovernorSnapshot {
            capacity: state.capacity,
            tokens: state.tokens,
            target_rate: state.target_rate,
            current_rate: state.current_rate,
            ramp_elapsed: Instant::now().saturating_duration_since(state.ramp_start),
        }
    }

    /// Overwrite the bucket fields from a snapshot, clamping them back
    /// into their invariants in case the file was edited by hand
    pub fn restore(&self, snapshot: &GovernorSnapshot) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        state.capacity = snapshot.capacity.max(1.0);
        state.tokens = snapshot.tokens.clamp(0.0, state.capacity);
        state.target_rate = snapshot.target_rate.max(MIN_EFFECTIVE_RATE);
        let floor = state.rate_floor(&self.config);
        state.current_rate = snapshot.current_rate.clamp(floor, state.target_rate);
        state.ramp_start = now
            .checked_sub(snapshot.ramp_elapsed)
            .unwrap_or(now);
        state.last_refill = now;
        state.streak = 0;
    }

    /// The host key this governor throttles
    #[must_use]
    pub const fn key(&self) -> &HostKey {
        &self.key
    }

    #[cfg(test)]
    fn current_rate(&self) -> f64 {
        self.state.lock().unwrap().current_rate
    }

    #[cfg(test)]
    fn tokens(&self) -> f64 {
        self.state.lock().unwrap().tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(target_rate: f64, capacity: f64, ramp: Duration) -> ThrottleConfig {
        ThrottleConfig {
            target_rate,
            capacity,
            ramp_window: ramp,
            ..ThrottleConfig::default()
        }
    }

    fn steady(target_rate: f64, capacity: f64) -> ThrottleConfig {
        config(target_rate, capacity, Duration::ZERO)
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_stay_within_bounds() {
        let governor = RateGovernor::new(HostKey::from("h"), steady(10.0, 3.0));
        // drain
        for _ in 0..3 {
            governor.acquire().await;
        }
        assert!(governor.tokens() >= 0.0);
        // idle long enough to refill far past capacity
        tokio::time::advance(Duration::from_secs(60)).await;
        governor.acquire().await;
        assert!(governor.tokens() <= 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_never_leaves_bounds() {
        let governor = RateGovernor::new(HostKey::from("h"), steady(2.0, 2.0));
        for _ in 0..50 {
            governor.report(Feedback::Throttled);
        }
        let floor = 2.0 * ThrottleConfig::default().rate_floor_fraction;
        assert!(governor.current_rate() >= floor - f64::EPSILON);

        for _ in 0..500 {
            governor.report(Feedback::Success);
        }
        assert!(governor.current_rate() <= 2.0 + f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_nudge_is_gentler_than_throttle() {
        let cfg = steady(1.0, 1.0);
        let throttled = RateGovernor::new(HostKey::from("a"), cfg);
        let errored = RateGovernor::new(HostKey::from("b"), cfg);
        throttled.report(Feedback::Throttled);
        errored.report(Feedback::Error);
        assert!(errored.current_rate() > throttled.current_rate());
    }

    #[tokio::test(start_paused = true)]
    async fn test_increase_requires_streak() {
        let governor = RateGovernor::new(HostKey::from("h"), steady(2.0, 1.0));
        governor.report(Feedback::Throttled); // 1.0
        let cut = governor.current_rate();

        governor.report(Feedback::Success);
        governor.report(Feedback::Success);
        assert!((governor.current_rate() - cut).abs() < f64::EPSILON);

        governor.report(Feedback::Success); // third in a row
        assert!(governor.current_rate() > cut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_spacing_at_one_per_second() {
        // capacity 1, 1 token/s: three grants must span ~2 seconds
        let governor = RateGovernor::new(HostKey::from("h"), steady(1.0, 1.0));
        let start = Instant::now();
        for _ in 0..3 {
            governor.acquire().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1900), "elapsed: {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(2500), "elapsed: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_start_delays_early_grants() {
        // 20% ramp start: the second token needs ~1/(0.2*2) = 2.5s
        // instead of the steady-state 0.5s
        let governor = RateGovernor::new(
            HostKey::from("h"),
            config(2.0, 1.0, Duration::from_secs(100)),
        );
        governor.acquire().await; // initial token
        let start = Instant::now();
        governor.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(2), "{:?}", start.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_until_blocks_grants() {
        let governor = RateGovernor::new(HostKey::from("h"), steady(100.0, 10.0));
        governor.acquire().await;
        governor.pause_until(Instant::now() + Duration::from_secs(5));
        let start = Instant::now();
        governor.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquirers_never_share_a_token() {
        let governor = std::sync::Arc::new(RateGovernor::new(HostKey::from("h"), steady(1.0, 1.0)));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let governor = governor.clone();
            handles.push(tokio::spawn(async move {
                governor.acquire().await;
                Instant::now()
            }));
        }
        let mut grant_times: Vec<Instant> = Vec::new();
        for handle in handles {
            grant_times.push(handle.await.unwrap());
        }
        grant_times.sort();
        // four grants from a 1-token, 1/s bucket span at least 3 virtual
        // seconds; pairwise spacing proves no token was double-granted
        assert!(grant_times[3].saturating_duration_since(start) >= Duration::from_millis(2900));
        for pair in grant_times.windows(2) {
            assert!(pair[1].saturating_duration_since(pair[0]) >= Duration::from_millis(900));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_restore_round_trip() {
        let governor = RateGovernor::new(HostKey::from("h"), steady(4.0, 4.0));
        governor.report(Feedback::Throttled);
        governor.acquire().await;
        let snapshot = governor.snapshot();

        let restored = RateGovernor::new(HostKey::from("h"), steady(4.0, 4.0));
        restored.restore(&snapshot);
        let second = restored.snapshot();
        assert!((second.tokens - snapshot.tokens).abs() < 1e-6);
        assert!((second.current_rate - snapshot.current_rate).abs() < f64::EPSILON);
        assert!((second.target_rate - snapshot.target_rate).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_clamps_corrupt_values() {
        let governor = RateGovernor::new(HostKey::from("h"), steady(2.0, 2.0));
        governor.restore(&GovernorSnapshot {
            capacity: 2.0,
            tokens: 99.0,
            target_rate: 2.0,
            current_rate: 50.0,
            ramp_elapsed: Duration::ZERO,
        });
        assert!(governor.tokens() <= 2.0);
        assert!(governor.current_rate() <= 2.0);
    }
}
