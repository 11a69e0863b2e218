//! `mizzle` is a library for fetching large batches of URLs without
//! overwhelming the hosts behind them.
//!
//! The hard part of bulk fetching is not the request, it is admission
//! control: deciding per host how many requests may be in flight and at
//! what rate, adapting to throttling signals, backing off from broken
//! hosts, and remembering all of that across restarts. This crate
//! centers on that problem; the actual transport and any media
//! extraction tool sit behind narrow traits.
//!
//! ```no_run
//! use mizzle_lib::{EngineBuilder, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let engine = EngineBuilder::builder().build().engine()?;
//!     let report = engine.run(["https://example.com/"]).await;
//!     println!("{} ok, {} failed", report.success_count(), report.failure_count());
//!     Ok(())
//! }
//! ```
//!
//! Per-host throttling lives in [`ratelimit`]: a [`ratelimit::RateGovernor`]
//! token bucket with slow-start and adaptive rate control, a
//! [`ratelimit::CircuitBreaker`], and the [`ratelimit::HostPool`] that owns
//! both per host key. [`persist::StateStore`] carries their learned state
//! across restarts.

#![warn(clippy::all, clippy::pedantic)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

mod engine;
mod extract;
mod metrics;
mod retry;
mod transport;
mod types;

pub mod persist;
pub mod ratelimit;

pub use engine::{
    Engine, EngineBuilder, RunReport, ShutdownHandle, UrlReport, DEFAULT_ATTEMPT_TIMEOUT,
    DEFAULT_GLOBAL_CONCURRENCY,
};
pub use extract::{CommandExtractor, ExtractOptions, Extraction, MediaExtractor};
pub use metrics::{AttemptRecord, MetricsCallback, MetricsCollector, RunSummary, TimelineSpan};
pub use retry::RetryConfig;
pub use transport::{FetchReply, HttpTransport, Transport};
pub use types::{ErrorKind, FinalStatus, Outcome, OutcomeKind, Result};
