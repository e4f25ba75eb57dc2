//! HTTP header names and the immutable header collection used by the proxy
//!
//! Every transformation on [`Headers`] returns a new value; the request as
//! received is never mutated in place.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;

/// Prefix shared by every proxy control header
pub const HELICONE_PREFIX: &str = "helicone-";

/// Prefix of the repeatable custom tag headers
pub const PROPERTY_PREFIX: &str = "helicone-property-";

pub const AUTHORIZATION: &str = "authorization";
pub const CONTENT_LENGTH: &str = "content-length";
pub const CONTENT_TYPE: &str = "content-type";
pub const CACHE_CONTROL: &str = "cache-control";
pub const HOST: &str = "host";
pub const USER_ID: &str = "user-id";
pub const RETRY_AFTER: &str = "retry-after";
pub const RATELIMIT_RESET_REQUESTS: &str = "x-ratelimit-reset-requests";

pub const HELICONE_AUTH: &str = "helicone-auth";
pub const HELICONE_USER_ID: &str = "helicone-user-id";
pub const HELICONE_REQUEST_ID: &str = "helicone-request-id";
pub const HELICONE_PROMPT_FORMAT: &str = "helicone-prompt-format";
pub const HELICONE_PROMPT_ID: &str = "helicone-prompt-id";
pub const HELICONE_PROMPT_NAME: &str = "helicone-prompt-name";

pub const HELICONE_CACHE_ENABLED: &str = "helicone-cache-enabled";
pub const HELICONE_CACHE_SAVE: &str = "helicone-cache-save";
pub const HELICONE_CACHE_READ: &str = "helicone-cache-read";
pub const HELICONE_CACHE_BUCKET_MAX_SIZE: &str = "helicone-cache-bucket-max-size";

pub const HELICONE_RATELIMIT_POLICY: &str = "helicone-ratelimit-policy";

pub const HELICONE_RETRY_ENABLED: &str = "helicone-retry-enabled";
pub const HELICONE_RETRY_NUM: &str = "helicone-retry-num";
pub const HELICONE_RETRY_FACTOR: &str = "helicone-retry-factor";
pub const HELICONE_RETRY_MIN_TIMEOUT: &str = "helicone-retry-min-timeout";
pub const HELICONE_RETRY_MAX_TIMEOUT: &str = "helicone-retry-max-timeout";

pub const HELICONE_FF_STREAM_FORCE_FORMAT: &str = "helicone-ff-stream-force-format";
pub const HELICONE_FF_INCREASE_TIMEOUT: &str = "helicone-ff-increase-timeout";

/// Response headers added by the proxy
pub mod response {
    pub const HELICONE_STATUS: &str = "helicone-status";
    pub const HELICONE_ID: &str = "helicone-id";
    pub const HELICONE_CACHE: &str = "helicone-cache";
    pub const HELICONE_CACHE_BUCKET_IDX: &str = "helicone-cache-bucket-idx";
    pub const HELICONE_ERROR: &str = "helicone-error";
    pub const RATELIMIT_LIMIT: &str = "helicone-ratelimit-limit";
    pub const RATELIMIT_REMAINING: &str = "helicone-ratelimit-remaining";
    pub const RATELIMIT_POLICY: &str = "helicone-ratelimit-policy";
    pub const RATELIMIT_RESET: &str = "helicone-ratelimit-reset";

    pub const STATUS_SUCCESS: &str = "success";
}

/// Connection-scoped headers that must not be forwarded
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Well-known paths
pub mod paths {
    /// Health check endpoint path
    pub const HEALTH: &str = "/health";

    /// Property logging endpoint path
    pub const LOG: &str = "/v1/log";
}

/// Common content types
pub mod content_types {
    pub const JSON: &str = "application/json";
    pub const JSON_UTF8: &str = "application/json;charset=UTF-8";
    pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
    pub const EVENT_STREAM: &str = "text/event-stream";
}

/// Ordered header multimap with lowercase names
///
/// Lookups are case-insensitive. Values that are not valid UTF-8 are kept
/// lossily so the collection can always be built from a [`HeaderMap`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_pairs<I, N, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: AsRef<str>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(name, value)| (name.as_ref().to_ascii_lowercase(), value.into()))
                .collect(),
        )
    }

    pub fn from_header_map(map: &HeaderMap) -> Self {
        Self(
            map.iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect(),
        )
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// True when `name` is present with the value `true` (any case)
    pub fn is_true(&self, name: &str) -> bool {
        self.get(name)
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("true"))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A copy with every `name` entry replaced by a single `value`
    pub fn with(&self, name: &str, value: impl Into<String>) -> Self {
        let mut next = self.without(name);
        next.0.push((name.to_ascii_lowercase(), value.into()));
        next
    }

    /// A copy with every `name` entry removed
    pub fn without(&self, name: &str) -> Self {
        self.filter(|key, _| !key.eq_ignore_ascii_case(name))
    }

    /// A copy keeping only the entries for which `keep` returns true
    pub fn filter(&self, keep: impl Fn(&str, &str) -> bool) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(name, value)| keep(name, value))
                .cloned()
                .collect(),
        )
    }

    /// The headers safe to send upstream: no proxy control headers, no
    /// `host`, no hop-by-hop headers
    pub fn for_upstream(&self) -> Self {
        self.filter(|name, _| {
            !name.starts_with(HELICONE_PREFIX) && name != HOST && !HOP_BY_HOP.contains(&name)
        })
    }

    /// Custom tags from `Helicone-Property-<name>` headers, keyed by `<name>`
    pub fn properties(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .filter_map(|(name, value)| {
                name.strip_prefix(PROPERTY_PREFIX)
                    .filter(|property| !property.is_empty())
                    .map(|property| (property.to_string(), value.clone()))
            })
            .collect()
    }

    /// Convert to an [`HeaderMap`], dropping entries that are not valid HTTP
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.0.len());
        for (name, value) in &self.0 {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        }
        map
    }
}

/// The bearer token carried by an `Authorization`-style value
pub fn bearer_token(value: &str) -> &str {
    let trimmed = value.trim();
    trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))
        .unwrap_or(trimmed)
        .trim()
}
