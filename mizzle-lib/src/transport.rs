//! The network transport seam.
//!
//! The engine never talks to the network directly; it calls
//! [`Transport::fetch`] and classifies whatever comes back. Tests swap
//! in scripted transports, production uses [`HttpTransport`].

use std::time::Duration;

use async_trait::async_trait;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use rand::prelude::IndexedRandom;
use url::Url;

use crate::types::{ErrorKind, Result};

/// Browser user agents rotated across requests, so a large batch does
/// not present a single synthetic fingerprint to every host
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1",
];

const ACCEPT_LANGUAGES: &[&str] = &["en-US,en;q=0.9", "en-GB,en;q=0.8", "en;q=0.7"];

/// What one HTTP attempt produced, reduced to the parts the engine
/// classifies on. The body is read to completion (so latency covers the
/// full transfer) but only its length is kept.
#[derive(Debug, Clone)]
pub struct FetchReply {
    /// Response status
    pub status: StatusCode,
    /// Response headers (`Retry-After` is read from here)
    pub headers: HeaderMap,
    /// Number of body bytes read
    pub body_len: usize,
}

/// An HTTP transport the engine can drive.
///
/// Implementations return `Ok` for any response that arrived, whatever
/// its status; `Err` is reserved for attempts that produced no response
/// at all (timeouts, connection failures, protocol errors).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute one GET against `url`, bounded by `timeout`
    async fn fetch(&self, url: &Url, timeout: Duration) -> Result<FetchReply>;
}

/// [`Transport`] backed by a shared [`reqwest::Client`]
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    default_headers: HeaderMap,
}

impl HttpTransport {
    /// Build a transport with connection pooling and gzip enabled.
    ///
    /// `default_headers` are sent with every request, underneath the
    /// rotating `User-Agent`/`Accept-Language` pair.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::BuildTransport`] if the underlying client
    /// cannot be constructed.
    pub fn new(default_headers: HeaderMap) -> Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .build()
            .map_err(ErrorKind::BuildTransport)?;
        Ok(Self {
            client,
            default_headers,
        })
    }

    fn request_headers(&self) -> HeaderMap {
        let mut rng = rand::rng();
        let mut headers = self.default_headers.clone();
        let insert = |headers: &mut HeaderMap, name: &'static str, value: &str| {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(HeaderName::from_static(name), value);
            }
        };
        if let Some(agent) = USER_AGENTS.choose(&mut rng) {
            insert(&mut headers, "user-agent", agent);
        }
        if let Some(lang) = ACCEPT_LANGUAGES.choose(&mut rng) {
            insert(&mut headers, "accept-language", lang);
        }
        insert(
            &mut headers,
            "accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        );
        headers
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: &Url, timeout: Duration) -> Result<FetchReply> {
        let response = self
            .client
            .get(url.clone())
            .headers(self.request_headers())
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        // drain the body so latency measures the full transfer; a
        // failure mid-body is a failure of the attempt
        let body = response.bytes().await?;

        Ok(FetchReply {
            status,
            headers,
            body_len: body.len(),
        })
    }
}
