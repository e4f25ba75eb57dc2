//! Records handed to the log sink
//!
//! The proxy produces exactly one [`LogEvent::Request`] per forwarded
//! request, after the client has already received its response. Cache hits
//! and property updates from the logging endpoint produce their own events.

use crate::domain::prompt::FormattedPrompt;
use crate::domain::types::{HashedCredential, PromptId, PromptName, RequestId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Whether a response came from the bucketed cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hit => f.write_str("HIT"),
            Self::Miss => f.write_str("MISS"),
        }
    }
}

/// Token usage for one exchange
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    /// True when the proxy tokenized the exchange itself because the
    /// upstream did not report usage
    #[serde(default)]
    pub proxy_calculated: bool,
}

impl Usage {
    /// Read the OpenAI-style `usage` object from a response body
    pub fn from_response_body(body: &Value) -> Option<Self> {
        let usage = body.get("usage")?;
        let prompt_tokens = usage.get("prompt_tokens").and_then(Value::as_u64);
        let completion_tokens = usage.get("completion_tokens").and_then(Value::as_u64);
        let total_tokens = usage.get("total_tokens").and_then(Value::as_u64).or(
            match (prompt_tokens, completion_tokens) {
                (Some(p), Some(c)) => Some(p + c),
                _ => None,
            },
        );
        let proxy_calculated = usage
            .get("helicone_calculated")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Some(Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
            proxy_calculated,
        })
    }
}

/// The request half of a log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLog {
    pub id: RequestId,
    pub created_at: DateTime<Utc>,
    pub method: String,
    pub url: String,
    pub path: String,
    /// Parsed request body as forwarded; `None` for empty or non-JSON bodies
    pub body: Option<Value>,
    pub auth_hash: HashedCredential,
    /// Hash of the proxy-account key from `Helicone-Auth`
    pub helicone_auth_hash: Option<HashedCredential>,
    pub user_id: Option<UserId>,
    pub prompt_id: Option<PromptId>,
    pub prompt_name: Option<PromptName>,
    pub properties: BTreeMap<String, String>,
    pub prompts: Vec<FormattedPrompt>,
    pub streamed: bool,
    pub cache: Option<CacheStatus>,
}

/// The response half of a log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseLog {
    pub status: u16,
    pub delay_ms: u64,
    pub body: Value,
    /// The captured body hit the capture ceiling and may be partial
    pub timed_out: bool,
    pub usage: Option<Usage>,
}

/// One completed proxied exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub request: RequestLog,
    pub response: ResponseLog,
}

/// Everything the proxy writes to the log sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    Request(Box<LogRecord>),
    CacheHit {
        request_id: RequestId,
        hit_at: DateTime<Utc>,
    },
    Properties {
        request_id: RequestId,
        properties: BTreeMap<String, String>,
    },
}

impl LogEvent {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::Request(record) => &record.request.id,
            Self::CacheHit { request_id, .. } | Self::Properties { request_id, .. } => request_id,
        }
    }
}
