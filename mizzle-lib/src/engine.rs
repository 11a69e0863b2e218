//! The admission engine: drives a batch of URLs to completion under
//! global and per-host limits.
//!
//! This module defines [`Engine`] and [`EngineBuilder`]. The builder
//! exposes every policy knob; the engine owns all per-host throttling
//! state for its lifetime and runs one batch at a time.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use http::header::HeaderMap;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use typed_builder::TypedBuilder;
use url::Url;

use crate::extract::{ExtractOptions, MediaExtractor};
use crate::metrics::{AttemptRecord, MetricsCallback, MetricsCollector, RunSummary};
use crate::persist::StateStore;
use crate::ratelimit::{HostEntry, HostGroups, HostKey, HostOverrides, HostPool, RateLimitConfig};
use crate::retry::RetryConfig;
use crate::transport::{HttpTransport, Transport};
use crate::types::{ErrorKind, FinalStatus, Outcome, Result};

/// Default number of concurrent workers across all hosts
pub const DEFAULT_GLOBAL_CONCURRENCY: usize = 10;

/// Default timeout for a single attempt
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Builder for [`Engine`].
///
/// ```
/// use mizzle_lib::EngineBuilder;
///
/// let engine = EngineBuilder::builder()
///     .global_concurrency(4usize)
///     .build()
///     .engine()
///     .unwrap();
/// # drop(engine);
/// ```
#[derive(TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
pub struct EngineBuilder {
    /// Number of worker slots shared across all hosts
    #[builder(default = DEFAULT_GLOBAL_CONCURRENCY)]
    global_concurrency: usize,

    /// Per-host throttling defaults (governor, breaker, concurrency)
    ratelimit: RateLimitConfig,

    /// Per-host overrides, keyed by host key string
    host_overrides: HostOverrides,

    /// CDN-collapse rules applied during URL normalization
    #[builder(default = HostGroups::default())]
    host_groups: HostGroups,

    /// Retry budget and backoff policy
    retry: RetryConfig,

    /// Timeout applied to each individual attempt
    #[builder(default = DEFAULT_ATTEMPT_TIMEOUT)]
    attempt_timeout: Duration,

    /// Headers sent with every HTTP request
    default_headers: HeaderMap,

    /// Where governor/breaker state is loaded from and saved to.
    /// `None` disables persistence.
    state_store: Option<StateStore>,

    /// Additionally save state on this interval while running
    save_interval: Option<Duration>,

    /// Transport override, mainly for tests; defaults to
    /// [`HttpTransport`]
    transport: Option<Arc<dyn Transport>>,

    /// Media-download delegate; required when `extract_options` is set
    extractor: Option<Arc<dyn MediaExtractor>>,

    /// When set, URLs are routed to the extractor instead of the HTTP
    /// transport
    extract_options: Option<ExtractOptions>,

    /// Invoked once with the summary when a run completes
    metrics_callback: Option<MetricsCallback>,
}

impl EngineBuilder {
    /// Construct the [`Engine`].
    ///
    /// # Errors
    ///
    /// Fails if the default HTTP transport cannot be built, or if
    /// extraction was requested without an extractor.
    pub fn engine(self) -> Result<Engine> {
        if self.extract_options.is_some() && self.extractor.is_none() {
            return Err(ErrorKind::ExtractorUnavailable(
                "extraction requested but no extractor configured".into(),
            ));
        }
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(self.default_headers)?),
        };
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Engine {
            global_concurrency: self.global_concurrency.max(1),
            pool: Arc::new(HostPool::new(self.ratelimit, self.host_overrides)),
            host_groups: self.host_groups,
            retry: self.retry,
            attempt_timeout: self.attempt_timeout,
            state_store: self.state_store,
            save_interval: self.save_interval,
            transport,
            extractor: self.extractor,
            extract_options: self.extract_options,
            metrics: Arc::new(MetricsCollector::new(self.metrics_callback)),
            shutdown_tx,
        })
    }
}

/// Handle for requesting a graceful shutdown from another task (e.g. a
/// signal handler). Cloneable and cheap.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Stop admitting new work. In-flight attempts finish within their
    /// timeout; state is persisted before [`Engine::run`] returns.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Result of one batch run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Aggregate latency/outcome statistics
    pub summary: RunSummary,
    /// Terminal state of every input URL
    pub urls: Vec<UrlReport>,
    /// Whether a shutdown signal left work incomplete
    pub interrupted: bool,
}

/// Terminal state of one input URL
#[derive(Debug, Clone)]
pub struct UrlReport {
    /// The input as given
    pub url: String,
    /// How it ended
    pub status: FinalStatus,
}

impl RunReport {
    /// Number of URLs that succeeded
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.urls.iter().filter(|u| u.status.is_success()).count()
    }

    /// Number of URLs that failed permanently
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.urls.iter().filter(|u| u.status.is_failure()).count()
    }
}

/// One admitted unit of work
struct Task {
    raw: String,
    url: Url,
    key: HostKey,
}

/// Free-list of worker lane ids, so timeline spans land on stable lanes
struct WorkerLanes(Mutex<Vec<usize>>);

impl WorkerLanes {
    fn new(count: usize) -> Self {
        Self(Mutex::new((0..count).rev().collect()))
    }

    fn take(&self) -> usize {
        self.0.lock().unwrap().pop().unwrap_or(0)
    }

    fn release(&self, lane: usize) {
        self.0.lock().unwrap().push(lane);
    }
}

/// The admission orchestrator.
///
/// Owns the host pool, the metrics collector, and the shutdown signal;
/// every throttling decision for a batch flows through one engine
/// instance, and multiple engines can coexist in a process.
pub struct Engine {
    global_concurrency: usize,
    pool: Arc<HostPool>,
    host_groups: HostGroups,
    retry: RetryConfig,
    attempt_timeout: Duration,
    state_store: Option<StateStore>,
    save_interval: Option<Duration>,
    transport: Arc<dyn Transport>,
    extractor: Option<Arc<dyn MediaExtractor>>,
    extract_options: Option<ExtractOptions>,
    metrics: Arc<MetricsCollector>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("global_concurrency", &self.global_concurrency)
            .field("retry", &self.retry)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("hosts", &self.pool.host_count())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// A handle that can request graceful shutdown from another task
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// The metrics collector, for callers that want live summaries
    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Drive a batch of URLs to completion.
    ///
    /// Inputs are normalized and deduplicated first; invalid URLs are
    /// reported as skipped, never queued. The rest flow through up to
    /// `global_concurrency` concurrent workers, each holding a per-host
    /// slot, a breaker pass, and a governor token around every attempt.
    ///
    /// The engine never aborts a batch because one URL failed; the
    /// report carries a terminal status per input.
    pub async fn run<I, S>(&self, urls: I) -> RunReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if let Some(store) = &self.state_store {
            self.pool.restore(&store.load());
        }

        let (tasks, mut reports) = self.admit(urls);
        log::info!(
            "Starting run: {} task(s), {} worker(s)",
            tasks.len(),
            self.global_concurrency
        );

        let saver = self.spawn_periodic_saver();
        let t0 = Instant::now();
        let lanes = WorkerLanes::new(self.global_concurrency);

        let completed: Vec<UrlReport> = futures::stream::iter(
            tasks
                .into_iter()
                .map(|task| self.process_url(task, t0, &lanes)),
        )
        .buffer_unordered(self.global_concurrency)
        .collect()
        .await;
        reports.extend(completed);

        if let Some(saver) = saver {
            saver.abort();
        }
        // the single authoritative save; runs on the cancellation path
        // too, so learned adjustments always survive
        if let Some(store) = &self.state_store {
            if let Err(e) = store.save(&self.pool.snapshot()) {
                log::warn!("Failed to persist throttling state: {e}");
            }
        }

        let summary = self.metrics.finish();
        let interrupted = reports
            .iter()
            .any(|r| matches!(r.status, FinalStatus::Cancelled));
        log::info!(
            "Run completed: {} ok, {} failed, error_rate={:.1}%",
            reports.iter().filter(|r| r.status.is_success()).count(),
            reports.iter().filter(|r| r.status.is_failure()).count(),
            summary.error_rate * 100.0
        );

        RunReport {
            summary,
            urls: reports,
            interrupted,
        }
    }

    /// Parse, normalize, and deduplicate the inputs. Returns the
    /// admitted tasks plus reports for everything rejected up front.
    fn admit<I, S>(&self, urls: I) -> (Vec<Task>, Vec<UrlReport>)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen: HashSet<String> = HashSet::new();
        let mut tasks = Vec::new();
        let mut reports = Vec::new();

        for raw in urls {
            let raw = raw.as_ref().trim().to_string();
            if raw.is_empty() {
                continue;
            }
            let url = match Url::parse(&raw) {
                Ok(url) => url,
                Err(e) => {
                    log::warn!("Skipping invalid URL `{raw}`: {e}");
                    reports.push(UrlReport {
                        url: raw,
                        status: FinalStatus::Skipped {
                            reason: format!("invalid URL: {e}"),
                        },
                    });
                    continue;
                }
            };
            let key = match HostKey::normalize(&url, &self.host_groups) {
                Ok(key) => key,
                Err(e) => {
                    log::warn!("Skipping `{raw}`: {e}");
                    reports.push(UrlReport {
                        url: raw,
                        status: FinalStatus::Skipped {
                            reason: e.to_string(),
                        },
                    });
                    continue;
                }
            };
            if !seen.insert(url.as_str().to_string()) {
                reports.push(UrlReport {
                    url: raw,
                    status: FinalStatus::Skipped {
                        reason: "duplicate".into(),
                    },
                });
                continue;
            }
            tasks.push(Task { raw, url, key });
        }

        (tasks, reports)
    }

    fn spawn_periodic_saver(&self) -> Option<tokio::task::JoinHandle<()>> {
        let interval = self.save_interval?;
        let store = self.state_store.clone()?;
        let pool = self.pool.clone();
        let mut rx = self.shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = sleep(interval) => {
                        if let Err(e) = store.save(&pool.snapshot()) {
                            log::warn!("Periodic state save failed: {e}");
                        }
                    }
                    _ = rx.changed() => return,
                }
            }
        }))
    }

    /// Full lifecycle of one URL: per-host slot, attempt/retry loop,
    /// guaranteed slot release.
    async fn process_url(&self, task: Task, t0: Instant, lanes: &WorkerLanes) -> UrlReport {
        let mut rx = self.shutdown_tx.subscribe();
        if *rx.borrow() {
            return UrlReport {
                url: task.raw,
                status: FinalStatus::Cancelled,
            };
        }

        let entry = self.pool.entry(&task.key);
        // the permit is dropped on every exit path below, including
        // cancellation, so slots can never leak
        let permit = tokio::select! {
            permit = entry.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    return UrlReport { url: task.raw, status: FinalStatus::Cancelled };
                }
            },
            _ = rx.changed() => {
                return UrlReport { url: task.raw, status: FinalStatus::Cancelled };
            }
        };

        let lane = lanes.take();
        let status = self.attempt_loop(&task, &entry, &mut rx, t0, lane).await;
        lanes.release(lane);
        drop(permit);

        UrlReport {
            url: task.raw,
            status,
        }
    }

    async fn attempt_loop(
        &self,
        task: &Task,
        entry: &HostEntry,
        rx: &mut watch::Receiver<bool>,
        t0: Instant,
        lane: usize,
    ) -> FinalStatus {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if *rx.borrow() {
                return FinalStatus::Cancelled;
            }

            if !entry.breaker.allow() {
                let retry_in = entry.breaker.retry_hint();
                log::debug!(
                    "Breaker open for '{}', skipping attempt {attempt} of {}",
                    task.key,
                    task.raw
                );
                let error = ErrorKind::HostUnavailable {
                    host: task.key.clone(),
                    retry_in,
                };
                if !self.retry.attempts_remain(attempt) {
                    return FinalStatus::Failed {
                        error: error.to_string(),
                        attempts: attempt,
                    };
                }
                // waiting out the remaining cooldown is the best
                // estimate for when the host may admit a trial again
                let delay = self.retry.delay(attempt, retry_in);
                if !self.sleep_or_shutdown(delay, rx).await {
                    return FinalStatus::Cancelled;
                }
                continue;
            }

            tokio::select! {
                () = entry.governor.acquire() => {}
                _ = rx.changed() => return FinalStatus::Cancelled,
            }

            let started = t0.elapsed();
            let outcome = self.attempt(task).await;
            let finished = t0.elapsed();

            // feedback and metrics happen only after the attempt has
            // fully completed; no speculative mutation
            self.pool.report(&task.key, &outcome);
            self.metrics.record(&AttemptRecord {
                url: task.raw.clone(),
                host: task.key.clone(),
                worker: lane,
                attempt,
                started,
                finished,
                kind: outcome.kind(),
                status: outcome.status_code().map(|s| s.as_u16()),
            });

            let (error, retry_after) = match outcome {
                Outcome::Success { status } => {
                    log::debug!("Fetched {} ({:?})", task.raw, finished - started);
                    return FinalStatus::Succeeded {
                        status: status.map(|s| s.as_u16()),
                        attempts: attempt,
                    };
                }
                Outcome::Fatal { status, reason } => {
                    return FinalStatus::Failed {
                        error: ErrorKind::Fatal {
                            url: task.raw.clone(),
                            reason: match status {
                                Some(s) => format!("{reason} ({s})"),
                                None => reason,
                            },
                        }
                        .to_string(),
                        attempts: attempt,
                    };
                }
                Outcome::Throttled {
                    status,
                    retry_after,
                } => (
                    ErrorKind::Throttled {
                        host: task.key.clone(),
                        status: status.map(|s| s.as_u16()),
                        retry_after,
                    },
                    retry_after,
                ),
                Outcome::Transient { reason } => (
                    ErrorKind::Transient {
                        host: task.key.clone(),
                        reason,
                    },
                    None,
                ),
            };

            if !self.retry.attempts_remain(attempt) {
                log::warn!("Giving up on {} after {attempt} attempt(s): {error}", task.raw);
                return FinalStatus::Failed {
                    error: error.to_string(),
                    attempts: attempt,
                };
            }
            let delay = self.retry.delay(attempt, retry_after);
            log::debug!("Retrying {} in {delay:?} ({error})", task.raw);
            if !self.sleep_or_shutdown(delay, rx).await {
                return FinalStatus::Cancelled;
            }
        }
    }

    /// Execute one attempt through the configured delegate
    async fn attempt(&self, task: &Task) -> Outcome {
        match (&self.extractor, &self.extract_options) {
            (Some(extractor), Some(options)) => {
                match extractor
                    .extract(&task.url, options, self.attempt_timeout)
                    .await
                {
                    Ok(extraction) => {
                        log::debug!(
                            "Extracted {} ({} file(s))",
                            task.raw,
                            extraction.files.len()
                        );
                        Outcome::Success { status: None }
                    }
                    Err(error) => classify_error(error),
                }
            }
            _ => match self.transport.fetch(&task.url, self.attempt_timeout).await {
                Ok(reply) => Outcome::from_response(reply.status, &reply.headers),
                Err(error) => classify_error(error),
            },
        }
    }

    /// Returns `false` if shutdown arrived before the delay elapsed
    async fn sleep_or_shutdown(&self, delay: Duration, rx: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            () = sleep(delay) => true,
            _ = rx.changed() => false,
        }
    }
}

/// Map a delegate error into an attempt outcome
fn classify_error(error: ErrorKind) -> Outcome {
    match error {
        ErrorKind::NetworkRequest(e) => Outcome::from_reqwest_error(&e),
        ErrorKind::Throttled {
            status, retry_after, ..
        } => Outcome::Throttled {
            status: status.and_then(|s| http::StatusCode::from_u16(s).ok()),
            retry_after,
        },
        ErrorKind::Transient { reason, .. } => Outcome::Transient { reason },
        ErrorKind::Fatal { reason, .. } => Outcome::Fatal {
            status: None,
            reason,
        },
        other => Outcome::Fatal {
            status: None,
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{BreakerConfig, ThrottleConfig};
    use crate::transport::FetchReply;
    use async_trait::async_trait;
    use http::{HeaderValue, StatusCode};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport that replays a scripted sequence of replies and counts
    /// how often it was called
    struct ScriptedTransport {
        calls: AtomicUsize,
        script: Mutex<VecDeque<FetchReply>>,
        fallback: StatusCode,
    }

    impl ScriptedTransport {
        fn new(codes: &[u16]) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(codes.iter().map(|&c| reply(c, None)).collect()),
                fallback: StatusCode::OK,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn reply(code: u16, retry_after: Option<&str>) -> FetchReply {
        let mut headers = HeaderMap::new();
        if let Some(value) = retry_after {
            headers.insert(http::header::RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        }
        FetchReply {
            status: StatusCode::from_u16(code).unwrap(),
            headers,
            body_len: 0,
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn fetch(&self, _url: &Url, _timeout: Duration) -> crate::Result<FetchReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| FetchReply {
                    status: self.fallback,
                    headers: HeaderMap::new(),
                    body_len: 0,
                }))
        }
    }

    fn fast_config() -> RateLimitConfig {
        RateLimitConfig {
            throttle: ThrottleConfig {
                target_rate: 1000.0,
                capacity: 1000.0,
                ramp_window: Duration::ZERO,
                ..ThrottleConfig::default()
            },
            ..RateLimitConfig::default()
        }
    }

    fn engine_with(transport: Arc<dyn Transport>, retries: u32, threshold: u32) -> Engine {
        EngineBuilder::builder()
            .global_concurrency(4usize)
            .transport(transport)
            .ratelimit(RateLimitConfig {
                breaker: BreakerConfig {
                    failure_threshold: threshold,
                    ..BreakerConfig::default()
                },
                ..fast_config()
            })
            .retry(RetryConfig {
                max_retries: retries,
                base_delay: Duration::from_millis(10),
                jitter_fraction: 0.0,
                ..RetryConfig::default()
            })
            .build()
            .engine()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_urls_admit_one_attempt() {
        let transport = ScriptedTransport::new(&[]);
        let engine = engine_with(transport.clone(), 3, 5);
        let report = engine
            .run([
                "https://example.com/page",
                "https://example.com/page",
                "https://example.com/page",
            ])
            .await;

        assert_eq!(transport.calls(), 1);
        assert_eq!(report.success_count(), 1);
        let skipped = report
            .urls
            .iter()
            .filter(|u| matches!(&u.status, FinalStatus::Skipped { reason } if reason == "duplicate"))
            .count();
        assert_eq!(skipped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_urls_are_skipped_not_queued() {
        let transport = ScriptedTransport::new(&[]);
        let engine = engine_with(transport.clone(), 3, 5);
        let report = engine.run(["not a url", "file:///etc/passwd"]).await;

        assert_eq!(transport.calls(), 0);
        assert!(report
            .urls
            .iter()
            .all(|u| matches!(u.status, FinalStatus::Skipped { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retry_until_success() {
        let transport = ScriptedTransport::new(&[500, 500]);
        let engine = engine_with(transport.clone(), 5, 10);
        let report = engine.run(["https://example.com/flaky"]).await;

        assert_eq!(transport.calls(), 3);
        match &report.urls[0].status {
            FinalStatus::Succeeded { attempts, .. } => assert_eq!(*attempts, 3),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_status_is_not_retried() {
        let transport = ScriptedTransport::new(&[404]);
        let engine = engine_with(transport.clone(), 5, 10);
        let report = engine.run(["https://example.com/gone"]).await;

        assert_eq!(transport.calls(), 1);
        assert_eq!(report.failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_rejects_without_touching_transport() {
        // five URLs on one host, every response 429, threshold 3, one
        // attempt each: the transport must see exactly 3 requests and
        // the remaining URLs fail fast on the open breaker
        let transport = ScriptedTransport::new(&[429, 429, 429, 429, 429]);
        let engine = EngineBuilder::builder()
            .global_concurrency(1usize)
            .transport(transport.clone() as Arc<dyn Transport>)
            .ratelimit(RateLimitConfig {
                breaker: BreakerConfig {
                    failure_threshold: 3,
                    ..BreakerConfig::default()
                },
                ..fast_config()
            })
            .retry(RetryConfig {
                max_retries: 1,
                ..RetryConfig::default()
            })
            .build()
            .engine()
            .unwrap();

        let report = engine
            .run([
                "https://example.com/1",
                "https://example.com/2",
                "https://example.com/3",
                "https://example.com/4",
                "https://example.com/5",
            ])
            .await;

        assert_eq!(transport.calls(), 3);
        assert_eq!(report.failure_count(), 5);
        let unavailable = report
            .urls
            .iter()
            .filter(|u| matches!(&u.status, FinalStatus::Failed { error, .. } if error.contains("unavailable")))
            .count();
        assert_eq!(unavailable, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_controls_delay() {
        let transport = ScriptedTransport::new(&[]);
        {
            let mut script = transport.script.lock().unwrap();
            script.push_back(reply(429, Some("5")));
        }
        let engine = engine_with(transport.clone(), 3, 10);

        let start = Instant::now();
        let report = engine.run(["https://example.com/limited"]).await;
        let elapsed = start.elapsed();

        assert_eq!(report.success_count(), 1);
        assert!(elapsed >= Duration::from_secs(5), "elapsed: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(7), "elapsed: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_host_admission_rate_is_bounded() {
        // capacity 1, 1 token/s, three URLs on one host with three free
        // workers: grants must be spaced out to ~1/s
        let transport = ScriptedTransport::new(&[]);
        let engine = EngineBuilder::builder()
            .global_concurrency(3usize)
            .transport(transport.clone() as Arc<dyn Transport>)
            .ratelimit(RateLimitConfig {
                throttle: ThrottleConfig {
                    target_rate: 1.0,
                    capacity: 1.0,
                    ramp_window: Duration::ZERO,
                    ..ThrottleConfig::default()
                },
                ..RateLimitConfig::default()
            })
            .build()
            .engine()
            .unwrap();

        let start = Instant::now();
        let report = engine
            .run([
                "https://example.com/a",
                "https://example.com/b",
                "https://example.com/c",
            ])
            .await;

        assert_eq!(report.success_count(), 3);
        assert!(start.elapsed() >= Duration::from_millis(1900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_work_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        let transport = ScriptedTransport::new(&[]);
        let engine = EngineBuilder::builder()
            .global_concurrency(1usize)
            .transport(transport.clone() as Arc<dyn Transport>)
            .ratelimit(RateLimitConfig {
                throttle: ThrottleConfig {
                    // slow bucket so the second URL is still waiting
                    // when the signal arrives
                    target_rate: 0.01,
                    capacity: 1.0,
                    ramp_window: Duration::ZERO,
                    ..ThrottleConfig::default()
                },
                ..RateLimitConfig::default()
            })
            .state_store(store.clone())
            .build()
            .engine()
            .unwrap();

        let handle = engine.shutdown_handle();
        tokio::spawn(async move {
            sleep(Duration::from_millis(500)).await;
            handle.shutdown();
        });

        let report = engine
            .run(["https://example.com/a", "https://example.com/b"])
            .await;

        assert!(report.interrupted);
        assert!(report
            .urls
            .iter()
            .any(|u| matches!(u.status, FinalStatus::Cancelled)));
        // state still hit the disk on the cancellation path
        assert!(store.path().exists());
        assert!(!store.load().hosts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_callback_receives_summary() {
        let received = Arc::new(Mutex::new(None));
        let received_in_cb = received.clone();
        let transport = ScriptedTransport::new(&[]);
        let engine = EngineBuilder::builder()
            .transport(transport.clone() as Arc<dyn Transport>)
            .ratelimit(fast_config())
            .metrics_callback(Arc::new(move |summary: &RunSummary| {
                *received_in_cb.lock().unwrap() = Some(summary.clone());
            }) as MetricsCallback)
            .build()
            .engine()
            .unwrap();

        engine.run(["https://example.com/a"]).await;
        let summary = received.lock().unwrap().clone().unwrap();
        assert_eq!(summary.success, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_round_trips_between_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        // first run: hammer the host with throttles to depress the rate
        let transport = ScriptedTransport::new(&[429, 429, 429]);
        let engine = EngineBuilder::builder()
            .transport(transport as Arc<dyn Transport>)
            .ratelimit(fast_config())
            .retry(RetryConfig {
                max_retries: 1,
                ..RetryConfig::default()
            })
            .state_store(store.clone())
            .build()
            .engine()
            .unwrap();
        engine
            .run([
                "https://example.com/1",
                "https://example.com/2",
                "https://example.com/3",
            ])
            .await;

        let saved = store.load();
        let host = &saved.hosts[&HostKey::from("example.com")];
        assert!(host.governor.current_rate < host.governor.target_rate);

        // second run: a fresh engine picks the depressed rate back up
        let transport = ScriptedTransport::new(&[]);
        let engine = EngineBuilder::builder()
            .transport(transport as Arc<dyn Transport>)
            .ratelimit(fast_config())
            .state_store(store.clone())
            .build()
            .engine()
            .unwrap();
        engine.run(["https://example.com/4"]).await;

        let reloaded = store.load();
        let restored = &reloaded.hosts[&HostKey::from("example.com")];
        assert!(restored.governor.current_rate < restored.governor.target_rate);
    }
}
