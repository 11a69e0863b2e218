use std::time::Duration;

use http::{HeaderMap, StatusCode};
use serde::Serialize;
use strum::Display;

use crate::ratelimit::retry_after_hint;

/// The classification of one completed attempt.
///
/// Every attempt — whether it produced an HTTP response, a transport
/// error, or a delegate result — collapses into one of these four
/// variants. The engine never inspects raw responses or errors outside
/// this classification.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The attempt succeeded (2xx/3xx, or delegate-reported success)
    Success {
        /// HTTP status, absent for delegate successes
        status: Option<StatusCode>,
    },
    /// The remote host asked us to slow down (429/503-class)
    Throttled {
        /// HTTP status that carried the signal, if any
        status: Option<StatusCode>,
        /// Parsed `Retry-After` hint, used verbatim for the next delay
        retry_after: Option<Duration>,
    },
    /// A failure that may succeed on retry (timeout, connection
    /// failure, 408, 5xx other than 503)
    Transient {
        /// Human-readable failure description
        reason: String,
    },
    /// A failure that will not succeed on retry (other 4xx, malformed
    /// responses, non-retryable delegate errors)
    Fatal {
        /// HTTP status, if the failure came from a response
        status: Option<StatusCode>,
        /// Human-readable failure description
        reason: String,
    },
}

/// Discriminant-only view of an [`Outcome`], used in metrics records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Attempt succeeded
    Success,
    /// Remote signalled throttling
    Throttled,
    /// Transient failure
    Transient,
    /// Permanent failure
    Fatal,
}

impl Outcome {
    /// Classify an HTTP response by status code and headers.
    ///
    /// 2xx/3xx are successes; 429 and 503 are throttling signals
    /// (with their `Retry-After` hint, when parseable); 408 and the
    /// remaining 5xx range are transient; every other 4xx is fatal.
    #[must_use]
    pub fn from_response(status: StatusCode, headers: &HeaderMap) -> Self {
        if status.is_success() || status.is_redirection() {
            return Self::Success {
                status: Some(status),
            };
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            return Self::Throttled {
                status: Some(status),
                retry_after: retry_after_hint(headers),
            };
        }
        if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
            return Self::Transient {
                reason: format!("status {status}"),
            };
        }
        Self::Fatal {
            status: Some(status),
            reason: format!("status {status}"),
        }
    }

    /// Classify a `reqwest` error.
    ///
    /// Timeouts and connection failures are transient; request
    /// construction, decoding, and redirect-policy errors are fatal.
    /// Anything else (connection reset mid-body, etc.) is treated as
    /// transient, since retrying is cheap and the breaker bounds the
    /// damage of a persistently broken host.
    #[must_use]
    pub fn from_reqwest_error(err: &reqwest::Error) -> Self {
        if err.is_builder() || err.is_decode() || err.is_redirect() {
            return Self::Fatal {
                status: err.status(),
                reason: err.to_string(),
            };
        }
        if let Some(status) = err.status() {
            // `Response::error_for_status` leaves the code on the error
            return Self::from_response(status, &HeaderMap::new());
        }
        Self::Transient {
            reason: err.to_string(),
        }
    }

    /// The discriminant-only view of this outcome
    #[must_use]
    pub const fn kind(&self) -> OutcomeKind {
        match self {
            Self::Success { .. } => OutcomeKind::Success,
            Self::Throttled { .. } => OutcomeKind::Throttled,
            Self::Transient { .. } => OutcomeKind::Transient,
            Self::Fatal { .. } => OutcomeKind::Fatal,
        }
    }

    /// HTTP status code carried by this outcome, if any
    #[must_use]
    pub const fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Success { status } | Self::Throttled { status, .. } | Self::Fatal { status, .. } => {
                *status
            }
            Self::Transient { .. } => None,
        }
    }

    /// Whether the attempt may be retried
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttled { .. } | Self::Transient { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use rstest::rstest;

    #[rstest]
    #[case(200, OutcomeKind::Success)]
    #[case(204, OutcomeKind::Success)]
    #[case(301, OutcomeKind::Success)]
    #[case(408, OutcomeKind::Transient)]
    #[case(429, OutcomeKind::Throttled)]
    #[case(500, OutcomeKind::Transient)]
    #[case(503, OutcomeKind::Throttled)]
    #[case(404, OutcomeKind::Fatal)]
    #[case(403, OutcomeKind::Fatal)]
    fn test_status_classification(#[case] code: u16, #[case] expected: OutcomeKind) {
        let status = StatusCode::from_u16(code).unwrap();
        let outcome = Outcome::from_response(status, &HeaderMap::new());
        assert_eq!(outcome.kind(), expected);
    }

    #[test]
    fn test_throttled_carries_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("7"));
        let outcome = Outcome::from_response(StatusCode::TOO_MANY_REQUESTS, &headers);
        match outcome {
            Outcome::Throttled { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("expected Throttled, got {other:?}"),
        }
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(OutcomeKind::Throttled.to_string(), "throttled");
        assert_eq!(OutcomeKind::Success.to_string(), "success");
    }
}
