use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::HostKey;

/// Result type alias used throughout `mizzle_lib`
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// Possible errors when fetching through `mizzle_lib`
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The given string cannot be parsed into a valid URL.
    /// Such inputs are skipped, never queued and never retried.
    #[error("Cannot parse `{0}` as a URL: {1}")]
    InvalidUrl(String, url::ParseError),

    /// A URL without a host component cannot be assigned a throttling key
    #[error("URL is missing a host")]
    InvalidUrlHost,

    /// The circuit breaker for this host is open; no network attempt was made.
    /// Eligible for retry within the URL's overall retry budget.
    #[error("Host `{host}` is unavailable (circuit open{})",
        .retry_in.map_or(String::new(), |d| format!(", retry in {}s", d.as_secs())))]
    HostUnavailable {
        /// The throttling key of the unavailable host
        host: HostKey,
        /// Remaining cooldown, if known
        retry_in: Option<Duration>,
    },

    /// The remote host signalled throttling (429/503-class response)
    #[error("Throttled by `{host}`{}", .status.map_or(String::new(), |s| format!(" (status {s})")))]
    Throttled {
        /// The throttling key of the host
        host: HostKey,
        /// HTTP status code, if the signal came from a response
        status: Option<u16>,
        /// Server-provided `Retry-After` hint
        retry_after: Option<Duration>,
    },

    /// A transient failure (timeout, connection failure, 5xx) that may
    /// succeed on retry
    #[error("Transient failure for `{host}`: {reason}")]
    Transient {
        /// The throttling key of the host
        host: HostKey,
        /// Human-readable failure description
        reason: String,
    },

    /// A permanent, non-retryable failure
    #[error("Permanent failure for `{url}`: {reason}")]
    Fatal {
        /// The URL that failed
        url: String,
        /// Human-readable failure description
        reason: String,
    },

    /// The retry budget for a URL was exhausted without a success
    #[error("Gave up on `{url}` after {attempts} attempts")]
    RetriesExhausted {
        /// The URL that failed
        url: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// Reqwest network error outside the classification above
    #[error("Network error: {0}")]
    NetworkRequest(#[from] reqwest::Error),

    /// The HTTP transport could not be constructed
    #[error("Failed to build HTTP transport: {0}")]
    BuildTransport(#[source] reqwest::Error),

    /// The media extraction delegate could not be located or spawned
    #[error("Extractor unavailable: {0}")]
    ExtractorUnavailable(String),

    /// Any form of I/O error, with the path it occurred at if known
    #[error("I/O error at `{path}`: {err}", path = .0.as_ref().map_or("<unknown>".into(), |p| p.display().to_string()), err = .1)]
    Io(Option<PathBuf>, #[source] std::io::Error),
}

impl ErrorKind {
    /// Whether another attempt for the same URL may succeed.
    ///
    /// `HostUnavailable` counts as retryable: the breaker may have
    /// recovered by the time the backoff delay has passed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::HostUnavailable { .. } | Self::Throttled { .. } | Self::Transient { .. }
        )
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(e: std::io::Error) -> Self {
        Self::Io(None, e)
    }
}
