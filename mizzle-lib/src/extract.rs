//! The media-extraction seam.
//!
//! Media-download jobs (video, metadata, thumbnails, subtitles) are
//! delegated to an external tool which the engine treats as a black
//! box: it either returns structured metadata and a list of written
//! files, or an error the engine classifies like any other attempt
//! outcome. The admission path (breaker, governor, concurrency slots)
//! is identical to HTTP fetches.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use url::Url;

use crate::ratelimit::HostKey;
use crate::types::{ErrorKind, Result};

/// Output toggles for a media-download job, passed through to the
/// delegate and opaque to the admission core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractOptions {
    /// Download the media stream itself
    pub write_media: bool,
    /// Write the metadata JSON next to the media
    pub write_info: bool,
    /// Write the thumbnail
    pub write_thumbnail: bool,
    /// Write subtitles
    pub write_subs: bool,
    /// Directory the delegate writes into
    pub output_dir: PathBuf,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            write_media: false,
            write_info: true,
            write_thumbnail: false,
            write_subs: false,
            output_dir: PathBuf::from("./downloads"),
        }
    }
}

/// What a successful extraction produced
#[derive(Debug, Clone)]
pub struct Extraction {
    /// Structured metadata reported by the delegate
    pub metadata: serde_json::Value,
    /// Files the delegate wrote
    pub files: Vec<PathBuf>,
}

/// A media-download delegate the engine can drive
#[async_trait]
pub trait MediaExtractor: Send + Sync {
    /// Run one extraction for `url`, bounded by `timeout`
    async fn extract(&self, url: &Url, options: &ExtractOptions, timeout: Duration)
        -> Result<Extraction>;
}

/// [`MediaExtractor`] that shells out to an external yt-dlp-compatible
/// program.
///
/// The program is invoked once per URL with `--dump-single-json` plus
/// the flags derived from [`ExtractOptions`]; its stdout is parsed as
/// the metadata document. Non-zero exits are transient (the tool
/// retries extraction internally and still fails on flaky hosts);
/// unparseable output is fatal.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    program: PathBuf,
}

impl CommandExtractor {
    /// Use the given executable directly
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Locate `name` on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::ExtractorUnavailable`] if no such
    /// executable exists.
    pub fn discover(name: &str) -> Result<Self> {
        let program = which::which(name)
            .map_err(|e| ErrorKind::ExtractorUnavailable(format!("{name}: {e}")))?;
        log::debug!("Using extractor at {}", program.display());
        Ok(Self { program })
    }

    fn command(&self, url: &Url, options: &ExtractOptions) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--no-warnings")
            .arg("--no-playlist")
            .arg("--dump-single-json")
            .arg("--paths")
            .arg(&options.output_dir);
        if options.write_media {
            cmd.arg("--no-skip-download");
        } else {
            cmd.arg("--skip-download");
        }
        if options.write_info {
            cmd.arg("--write-info-json");
        }
        if options.write_thumbnail {
            cmd.arg("--write-thumbnail");
        }
        if options.write_subs {
            cmd.arg("--write-subs").arg("--write-auto-subs");
        }
        cmd.arg(url.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl MediaExtractor for CommandExtractor {
    async fn extract(
        &self,
        url: &Url,
        options: &ExtractOptions,
        timeout: Duration,
    ) -> Result<Extraction> {
        let host = url
            .host_str()
            .map_or_else(|| HostKey::from("unknown"), HostKey::from);

        let output = tokio::time::timeout(timeout, self.command(url, options).output())
            .await
            .map_err(|_| ErrorKind::Transient {
                host: host.clone(),
                reason: format!("extractor timed out after {timeout:?}"),
            })?
            .map_err(|e| ErrorKind::Io(Some(self.program.clone()), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ErrorKind::Transient {
                host,
                reason: format!(
                    "extractor exited with {}: {}",
                    output.status,
                    stderr.lines().last().unwrap_or_default()
                ),
            });
        }

        let metadata: serde_json::Value =
            serde_json::from_slice(&output.stdout).map_err(|e| ErrorKind::Fatal {
                url: url.to_string(),
                reason: format!("extractor produced unparseable metadata: {e}"),
            })?;

        // the delegate reports files it wrote under `requested_downloads`
        let files = metadata
            .get("requested_downloads")
            .and_then(|downloads| downloads.as_array())
            .map(|downloads| {
                downloads
                    .iter()
                    .filter_map(|d| d.get("filepath"))
                    .filter_map(|p| p.as_str())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Extraction { metadata, files })
    }
}
