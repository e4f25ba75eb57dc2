//! Fixed-window rate limiting per hashed credential
//!
//! A policy arrives in `Helicone-RateLimit-Policy` either as the compact form
//! `<quota>;w=<seconds>[;u=<unit>]` or as a JSON object. Counters live in a
//! [`CounterStore`] keyed by credential hash, optional end user, window length
//! and window index, and expire with their window.

use crate::domain::{HashedCredential, UserId};
use crate::infrastructure::{CounterStore, StoreError};
use crate::proxy::headers::response;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

/// Body of the 429 response
pub const RATE_LIMITED_MESSAGE: &str =
    "Rate limit reached. Please wait before making more requests.";

/// What a policy quota counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitUnit {
    #[default]
    Request,
    Cents,
}

impl fmt::Display for RateLimitUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => f.write_str("request"),
            Self::Cents => f.write_str("cents"),
        }
    }
}

impl FromStr for RateLimitUnit {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "request" | "requests" => Ok(Self::Request),
            "cents" => Ok(Self::Cents),
            other => Err(PolicyError::UnknownUnit(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("Invalid rate limit policy `{0}`: expected `<quota>;w=<seconds>[;u=<unit>]`")]
    Malformed(String),

    #[error("Invalid rate limit policy: quota must be a positive integer")]
    InvalidQuota,

    #[error("Invalid rate limit policy: window must be a positive number of seconds")]
    InvalidWindow,

    #[error("Invalid rate limit policy: unknown unit `{0}`")]
    UnknownUnit(String),
}

#[derive(Debug, Deserialize)]
struct PolicyObject {
    quota: u64,
    time_window: u64,
    #[serde(default)]
    unit: RateLimitUnit,
}

/// Quota per window for one credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub quota: u64,
    /// Window length in seconds
    pub time_window: u64,
    pub unit: RateLimitUnit,
}

impl RateLimitPolicy {
    pub fn new(quota: u64, time_window: u64, unit: RateLimitUnit) -> Result<Self, PolicyError> {
        if quota == 0 {
            return Err(PolicyError::InvalidQuota);
        }
        if time_window == 0 {
            return Err(PolicyError::InvalidWindow);
        }
        Ok(Self {
            quota,
            time_window,
            unit,
        })
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.time_window)
    }

    /// The compact form echoed back in `Helicone-RateLimit-Policy`
    pub fn header_value(&self) -> String {
        format!("{};w={};u={}", self.quota, self.time_window, self.unit)
    }

    fn parse_compact(raw: &str) -> Result<Self, PolicyError> {
        let malformed = || PolicyError::Malformed(raw.to_string());
        let mut parts = raw.split(';').map(str::trim);

        let quota = parts
            .next()
            .filter(|part| !part.is_empty())
            .ok_or_else(malformed)?
            .parse::<u64>()
            .map_err(|_| PolicyError::InvalidQuota)?;

        let mut window = None;
        let mut unit = RateLimitUnit::default();
        for part in parts.filter(|part| !part.is_empty()) {
            let (name, value) = part.split_once('=').ok_or_else(malformed)?;
            match name.trim() {
                "w" => {
                    window = Some(
                        value
                            .trim()
                            .parse::<u64>()
                            .map_err(|_| PolicyError::InvalidWindow)?,
                    )
                }
                "u" => unit = value.parse()?,
                _ => return Err(malformed()),
            }
        }

        Self::new(quota, window.ok_or(PolicyError::InvalidWindow)?, unit)
    }
}

impl FromStr for RateLimitPolicy {
    type Err = PolicyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.starts_with('{') {
            let object: PolicyObject = serde_json::from_str(trimmed)
                .map_err(|_| PolicyError::Malformed(raw.to_string()))?;
            Self::new(object.quota, object.time_window, object.unit)
        } else {
            Self::parse_compact(trimmed)
        }
    }
}

/// Whose requests share a counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitScope {
    pub credential: HashedCredential,
    pub user: Option<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitStatus {
    Ok,
    RateLimited,
}

/// Outcome of one check, including the headers to return to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub status: RateLimitStatus,
    pub policy: RateLimitPolicy,
    pub remaining: u64,
    /// Seconds until the current window ends
    pub reset: Option<u64>,
    counter_key: String,
}

impl RateLimitDecision {
    pub fn is_limited(&self) -> bool {
        self.status == RateLimitStatus::RateLimited
    }

    pub fn counter_key(&self) -> &str {
        &self.counter_key
    }

    pub fn header_pairs(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (response::RATELIMIT_LIMIT, self.policy.quota.to_string()),
            (response::RATELIMIT_REMAINING, self.remaining.to_string()),
            (response::RATELIMIT_POLICY, self.policy.header_value()),
        ];
        if let Some(reset) = self.reset {
            headers.push((response::RATELIMIT_RESET, reset.to_string()));
        }
        headers
    }
}

/// Counter key for one scope and window
pub fn counter_key(scope: &RateLimitScope, policy: &RateLimitPolicy, window_index: u64) -> String {
    match &scope.user {
        Some(user) => format!(
            "rl:{}:{}:{}:{}",
            scope.credential, user, policy.time_window, window_index
        ),
        None => format!(
            "rl:{}:{}:{}",
            scope.credential, policy.time_window, window_index
        ),
    }
}

/// Cost in cents of a response, rounded up
pub fn cents_cost(total_tokens: u64, cents_per_1k_tokens: f64) -> u64 {
    let cost = (total_tokens as f64 / 1000.0) * cents_per_1k_tokens;
    if cost.is_finite() && cost > 0.0 {
        cost.ceil() as u64
    } else {
        0
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// Rate limiter over a shared [`CounterStore`]
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    pub async fn check(
        &self,
        scope: &RateLimitScope,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitDecision, StoreError> {
        self.check_at(scope, policy, unix_now()).await
    }

    /// Check against the window containing `now` (unix seconds)
    pub async fn check_at(
        &self,
        scope: &RateLimitScope,
        policy: &RateLimitPolicy,
        now: u64,
    ) -> Result<RateLimitDecision, StoreError> {
        let window_index = now / policy.time_window;
        let key = counter_key(scope, policy, window_index);
        let count = self.store.get(&key).await?.unwrap_or(0);

        let (status, remaining) = if count >= policy.quota {
            (RateLimitStatus::RateLimited, 0)
        } else {
            (
                RateLimitStatus::Ok,
                policy.quota.saturating_sub(count).saturating_sub(1),
            )
        };
        let reset = Some(policy.time_window - now % policy.time_window);

        debug!(
            counter_key = %key,
            count,
            quota = policy.quota,
            limited = status == RateLimitStatus::RateLimited,
            "Rate limit checked"
        );

        Ok(RateLimitDecision {
            status,
            policy: *policy,
            remaining,
            reset,
            counter_key: key,
        })
    }

    /// Add `amount` to the counter the decision was made against
    pub async fn record(&self, decision: &RateLimitDecision, amount: u64) -> Result<u64, StoreError> {
        if amount == 0 {
            return Ok(self.store.get(&decision.counter_key).await?.unwrap_or(0));
        }
        self.store
            .increment(&decision.counter_key, amount, decision.policy.window())
            .await
    }
}
