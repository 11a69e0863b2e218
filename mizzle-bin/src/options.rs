use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Default state file, relative to the working directory
pub(crate) const DEFAULT_STATE_FILE: &str = "mizzle_state.json";

/// Fetch batches of URLs without getting banned.
///
/// URLs are read from the command line and/or a file (one per line,
/// `#` comments allowed) and fetched under per-host rate limits,
/// circuit breaking, and retry with backoff. Learned throttling state
/// is persisted between runs.
#[derive(Parser, Debug)]
#[command(name = "mizzle", version, about)]
pub(crate) struct Options {
    /// URLs to fetch
    #[arg(value_name = "URL")]
    pub(crate) urls: Vec<String>,

    /// Read additional URLs from a file, one per line
    #[arg(short = 'f', long, value_name = "FILE")]
    pub(crate) urls_file: Option<PathBuf>,

    /// Number of concurrent workers across all hosts
    #[arg(short = 'c', long, default_value_t = mizzle_lib::DEFAULT_GLOBAL_CONCURRENCY)]
    pub(crate) concurrency: usize,

    /// Steady-state request rate per host (requests per second)
    #[arg(long, default_value_t = 1.0)]
    pub(crate) per_host_rate: f64,

    /// Burst capacity per host (tokens)
    #[arg(long, default_value_t = 2.0)]
    pub(crate) per_host_burst: f64,

    /// Concurrent requests per host
    #[arg(long, default_value_t = 2)]
    pub(crate) per_host_concurrency: usize,

    /// Timeout per attempt
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub(crate) timeout: Duration,

    /// Maximum attempts per URL
    #[arg(long, default_value_t = 5)]
    pub(crate) max_retries: u32,

    /// Slow-start ramp window after a host is first seen
    #[arg(long, default_value = "15s", value_parser = humantime::parse_duration)]
    pub(crate) ramp_window: Duration,

    /// Where to persist learned throttling state (`~` is expanded)
    #[arg(long, env = "MIZZLE_STATE_FILE", default_value = DEFAULT_STATE_FILE)]
    pub(crate) state_file: String,

    /// Do not load or save throttling state
    #[arg(long)]
    pub(crate) no_state: bool,

    /// Delegate URLs to an external media extractor instead of
    /// fetching them over HTTP
    #[arg(long)]
    pub(crate) extract: bool,

    /// Extractor executable to use with --extract
    #[arg(long, default_value = "yt-dlp", value_name = "PROGRAM")]
    pub(crate) extractor_bin: String,

    /// Download the media stream itself (with --extract)
    #[arg(long)]
    pub(crate) write_media: bool,

    /// Write thumbnails (with --extract)
    #[arg(long)]
    pub(crate) write_thumbnail: bool,

    /// Write subtitles (with --extract)
    #[arg(long)]
    pub(crate) write_subs: bool,

    /// Output directory for extracted files
    #[arg(short = 'o', long, default_value = "./downloads")]
    pub(crate) output_dir: PathBuf,

    /// Print the run summary as JSON instead of the human format
    #[arg(long)]
    pub(crate) json: bool,
}
