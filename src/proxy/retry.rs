//! Upstream forwarding with retry and backoff
//!
//! Only `429` and `500` responses are retried, and only when the request
//! enabled retries. The wait before each retry honours the upstream's
//! `retry-after` or `x-ratelimit-reset-requests` hint when present.

use crate::proxy::headers::{
    Headers, CONTENT_LENGTH, HELICONE_RETRY_ENABLED, HELICONE_RETRY_FACTOR,
    HELICONE_RETRY_MAX_TIMEOUT, HELICONE_RETRY_MIN_TIMEOUT, HELICONE_RETRY_NUM, HOP_BY_HOP,
    RATELIMIT_RESET_REQUESTS, RETRY_AFTER,
};
use async_trait::async_trait;
use axum::http::{Method, StatusCode};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Longest upstream reset hint the forwarder will wait for
pub const MAX_RESET_HINT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Upstream request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection error: {0}")]
    Transport(String),

    #[error("Invalid upstream URL: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetrySettingsError {
    #[error("Invalid {header} `{value}`")]
    InvalidValue { header: &'static str, value: String },
}

/// Backoff schedule for retried requests
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOptions {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub factor: f64,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            factor: 2.0,
            min_timeout: Duration::from_millis(1000),
            max_timeout: Duration::from_millis(10_000),
        }
    }
}

impl RetryOptions {
    /// Retry options requested by the client, `None` when retries are off
    pub fn from_headers(headers: &Headers) -> Result<Option<Self>, RetrySettingsError> {
        if !headers.is_true(HELICONE_RETRY_ENABLED) {
            return Ok(None);
        }

        let defaults = Self::default();
        let max_attempts = parse_header(headers, HELICONE_RETRY_NUM, |v| {
            v.parse::<u32>().ok().filter(|n| *n >= 1)
        })?
        .unwrap_or(defaults.max_attempts);
        let factor = parse_header(headers, HELICONE_RETRY_FACTOR, |v| {
            v.parse::<f64>().ok().filter(|f| f.is_finite() && *f >= 1.0)
        })?
        .unwrap_or(defaults.factor);
        let min_timeout = parse_header(headers, HELICONE_RETRY_MIN_TIMEOUT, |v| {
            v.parse::<u64>().ok().map(Duration::from_millis)
        })?
        .unwrap_or(defaults.min_timeout);
        let max_timeout = parse_header(headers, HELICONE_RETRY_MAX_TIMEOUT, |v| {
            v.parse::<u64>().ok().map(Duration::from_millis)
        })?
        .unwrap_or(defaults.max_timeout)
        .max(min_timeout);

        Ok(Some(Self {
            max_attempts,
            factor,
            min_timeout,
            max_timeout,
        }))
    }

    /// Wait before retry number `retry` (0-based):
    /// `min(min_timeout * factor^retry, max_timeout)`
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let millis = self.min_timeout.as_millis() as f64 * self.factor.powi(exponent);
        let capped = millis.min(self.max_timeout.as_millis() as f64);
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_millis(capped as u64)
        } else {
            self.max_timeout
        }
    }
}

fn parse_header<T>(
    headers: &Headers,
    header: &'static str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>, RetrySettingsError> {
    headers
        .get(header)
        .map(|raw| {
            parse(raw.trim()).ok_or_else(|| RetrySettingsError::InvalidValue {
                header,
                value: raw.to_string(),
            })
        })
        .transpose()
}

/// How long the upstream asked us to wait, capped at [`MAX_RESET_HINT`]
pub fn reset_hint(headers: &Headers) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(parse_hint_duration)
        .or_else(|| {
            headers
                .get(RATELIMIT_RESET_REQUESTS)
                .and_then(parse_hint_duration)
        })
        .map(|hint| hint.min(MAX_RESET_HINT))
}

/// Parse `"10"`, `"1.5s"`, `"250ms"` or compound values such as `"6m0s"`
pub fn parse_hint_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(seconds) = value.parse::<f64>() {
        return seconds_to_duration(seconds);
    }

    let mut total = 0.0;
    let mut rest = value;
    while !rest.is_empty() {
        let number_len = rest.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
        if number_len == 0 {
            return None;
        }
        let number: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 0.001,
            _ => return None,
        };
        total += number * scale;
        rest = &rest[unit_len..];
    }
    seconds_to_duration(total)
}

/// Finite hints too large for a `Duration` saturate to `Duration::MAX`
fn seconds_to_duration(seconds: f64) -> Option<Duration> {
    (seconds.is_finite() && seconds >= 0.0)
        .then(|| Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX))
}

/// A request ready to send upstream
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub url: String,
    /// Already stripped of proxy headers
    pub headers: Headers,
    pub body: Bytes,
    pub timeout: Duration,
}

pub type UpstreamBody = BoxStream<'static, Result<Bytes, UpstreamError>>;

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: UpstreamBody,
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
impl UpstreamResponse {
    /// Drain the body into memory
    pub async fn collect_body(self) -> Result<Bytes, UpstreamError> {
        let chunks: Vec<Bytes> = self.body.try_collect().await?;
        Ok(chunks.concat().into())
    }
}

/// The single place the proxy talks to the upstream API
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn send(&self, request: ForwardRequest) -> Result<UpstreamResponse, UpstreamError>;
}

/// [`UpstreamClient`] over a pooled `reqwest` client
#[derive(Debug, Clone)]
pub struct ReqwestUpstreamClient {
    client: reqwest::Client,
}

impl ReqwestUpstreamClient {
    pub fn new() -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl UpstreamClient for ReqwestUpstreamClient {
    async fn send(&self, request: ForwardRequest) -> Result<UpstreamResponse, UpstreamError> {
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| UpstreamError::InvalidUrl(format!("{}: {e}", request.url)))?;

        // Body length and compression are negotiated by the client itself
        let headers = request
            .headers
            .without(CONTENT_LENGTH)
            .without("accept-encoding")
            .to_header_map();

        let response = self
            .client
            .request(request.method, url)
            .headers(headers)
            .timeout(request.timeout)
            .body(request.body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout(request.timeout)
                } else {
                    UpstreamError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let headers = Headers::from_header_map(response.headers())
            .filter(|name, _| !HOP_BY_HOP.contains(&name) && name != CONTENT_LENGTH);
        let timeout = request.timeout;
        let body = response
            .bytes_stream()
            .map_err(move |e| {
                if e.is_timeout() {
                    UpstreamError::Timeout(timeout)
                } else {
                    UpstreamError::Transport(e.to_string())
                }
            })
            .boxed();

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::INTERNAL_SERVER_ERROR
}

/// Forwards requests, retrying transient upstream failures
#[derive(Clone)]
pub struct RetryForwarder {
    client: Arc<dyn UpstreamClient>,
}

impl RetryForwarder {
    pub fn new(client: Arc<dyn UpstreamClient>) -> Self {
        Self { client }
    }

    /// Send `request`, retrying per `retry`
    ///
    /// Once attempts are exhausted the last response is returned unchanged.
    /// Transport errors and timeouts are returned immediately.
    pub async fn forward(
        &self,
        request: ForwardRequest,
        retry: Option<&RetryOptions>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let max_attempts = retry.map_or(1, |options| options.max_attempts.max(1));
        let mut attempt = 1;

        loop {
            let response = self.send_once(request.clone()).await?;
            let status = response.status;

            let Some(options) = retry.filter(|_| is_retryable(status) && attempt < max_attempts)
            else {
                debug!(
                    status = status.as_u16(),
                    attempt,
                    url = %request.url,
                    "Upstream responded"
                );
                return Ok(response);
            };

            let delay = reset_hint(&response.headers).unwrap_or_else(|| options.backoff(attempt - 1));
            warn!(
                status = status.as_u16(),
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Retrying upstream request"
            );
            drop(response);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn send_once(&self, request: ForwardRequest) -> Result<UpstreamResponse, UpstreamError> {
        let timeout = request.timeout;
        tokio::time::timeout(timeout, self.client.send(request))
            .await
            .map_err(|_| UpstreamError::Timeout(timeout))?
    }
}
