//! Type definitions for the proxy module

use crate::proxy::cache::CacheSettingsError;
use crate::proxy::logging_endpoint::LoggingEndpointError;
use crate::proxy::prompt::TemplateError;
use crate::proxy::rate_limit::{PolicyError, RateLimitDecision};
use crate::proxy::retry::{RetrySettingsError, UpstreamError};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ========== Size and Capacity Types ==========

/// Maximum size for HTTP request bodies in bytes
#[nutype(
    validate(predicate = |size: &usize| *size > 0),
    derive(Clone, Copy, Debug, Display, PartialEq, Deserialize, Serialize, TryFrom, AsRef)
)]
pub struct RequestSizeLimit(usize);

/// Base URL of the upstream completion API, without a trailing slash
#[nutype(
    sanitize(trim, with = |s: String| s.trim_end_matches('/').to_string()),
    validate(predicate = |s: &str| s.starts_with("http://") || s.starts_with("https://")),
    derive(Clone, Debug, Display, PartialEq, Deserialize, Serialize, TryFrom, AsRef)
)]
pub struct UpstreamBaseUrl(String);

/// Default upstream when none is configured
pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://api.openai.com";

/// Default request body ceiling
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

/// Proxy configuration
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub upstream_base_url: UpstreamBaseUrl,
    pub max_request_size: RequestSizeLimit,
    /// Upstream timeout for ordinary requests
    pub request_timeout: Duration,
    /// Upstream timeout when `Helicone-FF-Increase-Timeout: true`
    pub extended_timeout: Duration,
    /// Longest the log task waits for the response body
    pub log_body_timeout: Duration,
    /// Price used to weigh responses against `cents` rate limits
    pub cents_per_1k_tokens: f64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_base_url: UpstreamBaseUrl::try_new(DEFAULT_UPSTREAM_BASE_URL.to_string())
                .expect("default upstream URL is valid"),
            max_request_size: RequestSizeLimit::try_new(DEFAULT_MAX_REQUEST_SIZE)
                .expect("10MB is valid"),
            request_timeout: Duration::from_secs(600),
            extended_timeout: Duration::from_secs(1800),
            log_body_timeout: Duration::from_secs(900),
            cents_per_1k_tokens: 0.2,
        }
    }
}

/// Errors that can occur in the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Request too large (max: {max_size} bytes)")]
    RequestTooLarge { max_size: RequestSizeLimit },

    #[error("No authorization header found!")]
    MissingCredential,

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    CacheSettings(#[from] CacheSettingsError),

    #[error(transparent)]
    RetrySettings(#[from] RetrySettingsError),

    #[error(transparent)]
    RateLimitPolicy(#[from] PolicyError),

    #[error(transparent)]
    LoggingEndpoint(#[from] LoggingEndpointError),

    #[error("Rate limit reached")]
    RateLimited(Box<RateLimitDecision>),

    #[error("Upstream request timed out after {0:?}")]
    UpstreamTimeout(Duration),

    #[error("Upstream error: {0}")]
    Upstream(UpstreamError),

    #[error("HTTP error: {0}")]
    HttpError(#[from] http::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<UpstreamError> for ProxyError {
    fn from(error: UpstreamError) -> Self {
        match error {
            UpstreamError::Timeout(after) => Self::UpstreamTimeout(after),
            other => Self::Upstream(other),
        }
    }
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;
