//! Parsing of server throttling hints.

use std::time::{Duration, SystemTime};

use http::{HeaderMap, HeaderValue};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum RetryAfterParseError {
    #[error("Unable to parse value '{0}'")]
    ValueError(String),

    #[error("Header value contains invalid chars")]
    HeaderValueError,
}

/// Parse a `Retry-After` header value as specified per
/// [RFC 7231 section 7.1.3](https://www.rfc-editor.org/rfc/rfc7231#section-7.1.3):
/// either delay-seconds or an HTTP-date.
pub(crate) fn parse_retry_after(value: &HeaderValue) -> Result<Duration, RetryAfterParseError> {
    let value = value
        .to_str()
        .map_err(|_| RetryAfterParseError::HeaderValueError)?;

    value.parse::<u64>().map(Duration::from_secs).or_else(|_| {
        httpdate::parse_http_date(value)
            .map(|date| {
                date.duration_since(SystemTime::now())
                    // a date in the past means "retry immediately"
                    .unwrap_or(Duration::ZERO)
            })
            .map_err(|_| RetryAfterParseError::ValueError(value.into()))
    })
}

/// The server's `Retry-After` hint for this response, if present and
/// parseable. Unparseable values are ignored rather than failing the
/// attempt; the computed backoff applies instead.
#[must_use]
pub fn retry_after_hint(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(http::header::RETRY_AFTER)
        .and_then(|value| parse_retry_after(value).ok())
}
