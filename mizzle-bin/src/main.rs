//! `mizzle` fetches large batches of URLs while protecting the hosts
//! behind them: per-host token buckets with slow-start, circuit
//! breakers, retry with backoff, and throttling state that survives
//! restarts.
//!
//! Fetch a handful of pages:
//!
//! ```sh
//! mizzle https://example.com/a https://example.com/b
//! ```
//!
//! Fetch a list from a file with 20 workers:
//!
//! ```sh
//! mizzle -c 20 -f urls.txt
//! ```
//!
//! Download media through an external extractor:
//!
//! ```sh
//! mizzle --extract --write-media -o ./downloads https://www.youtube.com/watch?v=...
//! ```

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use mizzle_lib::persist::StateStore;
use mizzle_lib::ratelimit::{Concurrency, RateLimitConfig, ThrottleConfig};
use mizzle_lib::{
    CommandExtractor, Engine, EngineBuilder, ExtractOptions, MediaExtractor, RetryConfig, RunReport,
};

mod options;

use options::Options;

/// Process exit codes, mirrored in the README
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitCode {
    Success = 0,
    // 1 is the implicit code for any error bubbled to main()
    FetchFailure = 2,
    Interrupted = 3,
}

fn main() -> Result<()> {
    let options = Options::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let code = runtime.block_on(run(options))?;
    std::process::exit(code as i32);
}

async fn run(options: Options) -> Result<ExitCode> {
    let urls = collect_urls(&options)?;
    if urls.is_empty() {
        anyhow::bail!("no URLs given; pass them as arguments or via --urls-file");
    }

    let engine = build_engine(&options)?;

    // first Ctrl-C drains gracefully, a second one aborts hard
    let handle = engine.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nshutting down, waiting for in-flight requests...");
            handle.shutdown();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(ExitCode::Interrupted as i32);
        }
    });

    let report = engine.run(&urls).await;
    print_report(&options, &report)?;

    Ok(if report.interrupted {
        ExitCode::Interrupted
    } else if report.failure_count() > 0 {
        ExitCode::FetchFailure
    } else {
        ExitCode::Success
    })
}

fn collect_urls(options: &Options) -> Result<Vec<String>> {
    let mut urls = options.urls.clone();
    if let Some(file) = &options.urls_file {
        let content = fs::read_to_string(file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        urls.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(String::from),
        );
    }
    Ok(urls)
}

fn build_engine(options: &Options) -> Result<Engine> {
    let ratelimit = RateLimitConfig {
        concurrency: Concurrency(options.per_host_concurrency),
        throttle: ThrottleConfig {
            target_rate: options.per_host_rate,
            capacity: options.per_host_burst,
            ramp_window: options.ramp_window,
            ..ThrottleConfig::default()
        },
        ..RateLimitConfig::default()
    };
    let retry = RetryConfig {
        max_retries: options.max_retries,
        ..RetryConfig::default()
    };

    let builder = EngineBuilder::builder()
        .global_concurrency(options.concurrency)
        .ratelimit(ratelimit)
        .retry(retry)
        .attempt_timeout(options.timeout);

    let state_store = (!options.no_state).then(|| {
        let path = shellexpand::tilde(&options.state_file).into_owned();
        StateStore::new(path)
    });
    let (extractor, extract_options) = if options.extract {
        let extractor = CommandExtractor::discover(&options.extractor_bin)
            .with_context(|| format!("extractor `{}` not usable", options.extractor_bin))?;
        let extract_options = ExtractOptions {
            write_media: options.write_media,
            write_info: true,
            write_thumbnail: options.write_thumbnail,
            write_subs: options.write_subs,
            output_dir: options.output_dir.clone(),
        };
        (
            Some(Arc::new(extractor) as Arc<dyn MediaExtractor>),
            Some(extract_options),
        )
    } else {
        (None, None)
    };

    builder
        .state_store(state_store)
        .save_interval(Some(Duration::from_secs(60)))
        .extractor(extractor)
        .extract_options(extract_options)
        .build()
        .engine()
        .context("failed to build engine")
}

fn print_report(options: &Options, report: &RunReport) -> Result<()> {
    if options.json {
        println!("{}", serde_json::to_string_pretty(&report.summary)?);
        return Ok(());
    }

    for url in &report.urls {
        let label = if url.status.is_success() {
            style("ok").green()
        } else if url.status.is_failure() {
            style("fail").red()
        } else {
            style("skip").yellow()
        };
        println!("{label:>4}  {}  {}", url.url, url.status);
    }

    let summary = &report.summary;
    println!();
    println!(
        "{} attempt(s): {} ok, {} failed ({:.1}% error rate)",
        summary.total,
        style(summary.success).green(),
        style(summary.errors).red(),
        summary.error_rate * 100.0
    );
    if let (Some(mean), Some(p95)) = (summary.mean, summary.p95) {
        println!("latency: mean {:.0}ms, p95 {:.0}ms", mean * 1000.0, p95 * 1000.0);
    }
    if !summary.status_counts.is_empty() {
        let mut codes: Vec<_> = summary.status_counts.iter().collect();
        codes.sort();
        let rendered: Vec<String> = codes
            .iter()
            .map(|(code, count)| format!("{code}: {count}"))
            .collect();
        println!("status codes: {}", rendered.join(", "));
    }
    Ok(())
}
