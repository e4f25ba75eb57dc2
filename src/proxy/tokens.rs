//! Token accounting for streamed responses
//!
//! Streamed completions do not report usage, so the proxy counts tokens
//! itself with the r50k byte-pair encoding and marks the result as
//! proxy-calculated.

use crate::domain::Usage;
use serde_json::Value;
use std::sync::OnceLock;
use thiserror::Error;
use tiktoken_rs::CoreBPE;

/// Fixed structural tokens of a chat request
pub const CHAT_BASE_OVERHEAD: u64 = 3;

/// Structural tokens added per chat message
pub const CHAT_PER_MESSAGE_OVERHEAD: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenizerError {
    #[error("Tokenizer unavailable: {0}")]
    Unavailable(String),

    #[error("Cannot count request tokens: {0}")]
    InvalidRequest(String),

    #[error("Cannot count response tokens: {0}")]
    InvalidResponse(String),
}

fn encoder() -> Result<&'static CoreBPE, TokenizerError> {
    static ENCODER: OnceLock<Result<CoreBPE, String>> = OnceLock::new();
    ENCODER
        .get_or_init(|| tiktoken_rs::r50k_base().map_err(|e| e.to_string()))
        .as_ref()
        .map_err(|e| TokenizerError::Unavailable(e.clone()))
}

pub fn count_tokens(text: &str) -> Result<u64, TokenizerError> {
    Ok(encoder()?.encode_ordinary(text).len() as u64)
}

/// Text sent to the model plus the structural overhead of its format
pub fn request_text(body: &Value) -> Result<(String, u64), TokenizerError> {
    if let Some(prompt) = body.get("prompt") {
        return match prompt {
            Value::String(text) => Ok((text.clone(), 0)),
            Value::Array(parts) => Ok((parts.iter().filter_map(Value::as_str).collect(), 0)),
            _ => Err(TokenizerError::InvalidRequest(
                "`prompt` is neither a string nor a list".to_string(),
            )),
        };
    }

    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        let text = messages
            .iter()
            .map(|message| content_text(message.get("content")))
            .collect::<String>();
        let overhead = CHAT_BASE_OVERHEAD + CHAT_PER_MESSAGE_OVERHEAD * messages.len() as u64;
        return Ok((text, overhead));
    }

    Err(TokenizerError::InvalidRequest(
        "body has neither `prompt` nor `messages`".to_string(),
    ))
}

fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}

/// Concatenated choice text of every chunk that carries choices
pub fn response_text(chunks: &[Value]) -> Result<String, TokenizerError> {
    let mut text = String::new();
    for chunk in chunks {
        let Some(choices) = chunk.get("choices") else {
            continue;
        };
        let choices = choices.as_array().ok_or_else(|| {
            TokenizerError::InvalidResponse("`choices` is not a list".to_string())
        })?;
        for choice in choices {
            if let Some(delta) = choice.get("delta") {
                text.push_str(delta.get("content").and_then(Value::as_str).unwrap_or(""));
            } else if let Some(piece) = choice.get("text").and_then(Value::as_str) {
                text.push_str(piece);
            }
        }
    }
    Ok(text)
}

/// Count request and response tokens for a streamed exchange
pub fn compute_usage(request_body: &Value, chunks: &[Value]) -> Result<Usage, TokenizerError> {
    let (request, overhead) = request_text(request_body)?;
    let prompt_tokens = count_tokens(&request)? + overhead;
    let completion_tokens = count_tokens(&response_text(chunks)?)?;

    Ok(Usage {
        prompt_tokens: Some(prompt_tokens),
        completion_tokens: Some(completion_tokens),
        total_tokens: Some(prompt_tokens + completion_tokens),
        proxy_calculated: true,
    })
}

/// True when the upstream did not report completion tokens
pub fn lacks_completion_usage(body: &Value) -> bool {
    body.get("usage")
        .and_then(|usage| usage.get("completion_tokens"))
        .and_then(Value::as_u64)
        .is_none()
}

/// Write a proxy-calculated usage object into a response body
pub fn annotate_usage(body: &mut Value, usage: &Usage) {
    if let Some(object) = body.as_object_mut() {
        object.insert(
            "usage".to_string(),
            serde_json::json!({
                "prompt_tokens": usage.prompt_tokens,
                "completion_tokens": usage.completion_tokens,
                "total_tokens": usage.total_tokens,
                "helicone_calculated": true,
            }),
        );
    }
}
