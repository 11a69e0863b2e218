use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{ErrorKind, Result};

/// A canonical throttling-group identifier derived from a URL.
///
/// Most URLs map to their lowercase host component, but hosts matching a
/// configured [`HostGroups`] pattern collapse into one shared key so that
/// a whole CDN family is throttled as a single logical host.
///
/// The mapping is pure and stable: identical URLs always yield the same
/// key, and collapsed groups never diverge across calls.
///
/// # Examples
///
/// ```
/// use mizzle_lib::ratelimit::{HostGroups, HostKey};
/// use url::Url;
///
/// let url = Url::parse("https://r4---sn-q4fl6n6r.googlevideo.com/videoplayback").unwrap();
/// let key = HostKey::normalize(&url, &HostGroups::default()).unwrap();
/// assert_eq!(key.as_str(), "youtube-cdn");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostKey(String);

impl HostKey {
    /// Derive the throttling key for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidUrlHost`] if the URL has no authority
    /// (e.g. `file:` or `data:` URLs). Callers treat such URLs as
    /// invalid input and skip them.
    pub fn normalize(url: &Url, groups: &HostGroups) -> Result<Self> {
        let host = url.host_str().ok_or(ErrorKind::InvalidUrlHost)?;
        let host = host.to_lowercase();
        match groups.resolve(&host) {
            Some(group) => Ok(Self(group.to_string())),
            None => Ok(Self(host)),
        }
    }

    /// Get the key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for HostKey {
    fn from(host: &str) -> Self {
        Self(host.to_lowercase())
    }
}

impl From<String> for HostKey {
    fn from(host: String) -> Self {
        Self(host.to_lowercase())
    }
}

/// One host-collapse rule: hosts matching `pattern` share the key `key`.
///
/// A pattern starting with a dot (`.googlevideo.com`) matches any
/// subdomain of that suffix; any other pattern matches the host exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostGroup {
    /// Suffix (leading dot) or exact host to match
    pub pattern: String,
    /// Shared key for all matching hosts
    pub key: String,
}

/// The set of host-collapse rules applied during normalization.
///
/// The default set collapses the YouTube serving infrastructure, whose
/// media servers rotate through thousands of `*.googlevideo.com`
/// subdomains that all share one rate-limit domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostGroups(Vec<HostGroup>);

impl HostGroups {
    /// A group set with no collapse rules: every host is its own key
    #[must_use]
    pub const fn none() -> Self {
        Self(Vec::new())
    }

    /// Build a group set from explicit rules
    #[must_use]
    pub fn new(groups: Vec<HostGroup>) -> Self {
        Self(groups)
    }

    /// The shared key for `host`, if any rule matches.
    /// `host` must already be lowercase.
    #[must_use]
    pub fn resolve(&self, host: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|g| {
                if let Some(suffix) = g.pattern.strip_prefix('.') {
                    // `.example.com` matches `a.example.com` but not
                    // `example.com` itself, mirroring cookie-domain rules
                    host.strip_suffix(suffix)
                        .is_some_and(|rest| rest.ends_with('.'))
                } else {
                    host == g.pattern
                }
            })
            .map(|g| g.key.as_str())
    }
}

impl Default for HostGroups {
    fn default() -> Self {
        let rule = |pattern: &str, key: &str| HostGroup {
            pattern: pattern.to_string(),
            key: key.to_string(),
        };
        Self(vec![
            rule(".googlevideo.com", "youtube-cdn"),
            rule(".ytimg.com", "youtube-static"),
            rule("www.youtube.com", "youtube-frontend"),
        ])
    }
}
