//! Prompt template extraction
//!
//! When a request carries `Helicone-Prompt-Format`, `{{name}}` placeholders
//! in the body are resolved from the accompanying values before the body is
//! forwarded. The templates themselves are kept for the log record.

use crate::domain::{FormattedPrompt, Prompt};
use crate::proxy::headers::{Headers, CONTENT_LENGTH, HELICONE_PROMPT_FORMAT};
use bytes::Bytes;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::LazyLock;
use thiserror::Error;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{([^{}]+)\}\}").expect("placeholder pattern is a valid regex")
});

/// User-caused template failures, reported as HTTP 400
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("Error parsing prompt: request body is not valid JSON: {0}")]
    InvalidBody(String),

    #[error("Error parsing prompt: {0}")]
    InvalidPrompt(String),

    #[error("Missing values in the prompt: {}", .0.join(", "))]
    MissingValues(Vec<String>),

    #[error("Missing placeholders in the prompt regex: {}", .0.join(", "))]
    UnresolvedPlaceholders(Vec<String>),

    #[error("Message {index} content is not a string or an object")]
    InvalidMessageContent { index: usize },

    #[error("Prompt value `{name}` must be a string, number, boolean or null")]
    InvalidValue { name: String },
}

/// The request as it will be forwarded, plus the templates that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedPrompt {
    pub body: Bytes,
    pub headers: Headers,
    pub prompts: Vec<FormattedPrompt>,
}

/// Whether the request asked for template resolution
pub fn template_mode(headers: &Headers) -> bool {
    headers.contains(HELICONE_PROMPT_FORMAT)
}

/// Resolve templates in `body` when template mode is on
///
/// With template mode off the body and headers come back untouched and no
/// prompt is recorded.
pub fn extract_prompt(body: &Bytes, headers: &Headers) -> Result<ExtractedPrompt, TemplateError> {
    if !template_mode(headers) {
        return Ok(ExtractedPrompt {
            body: body.clone(),
            headers: headers.clone(),
            prompts: Vec::new(),
        });
    }

    let mut json: Value = if body.is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_slice(body).map_err(|e| TemplateError::InvalidBody(e.to_string()))?
    };

    let has_messages = json
        .get("messages")
        .and_then(Value::as_array)
        .is_some_and(|messages| !messages.is_empty());

    let prompts = if has_messages {
        rewrite_messages(&mut json)?
    } else {
        rewrite_top_level_prompt(&mut json)?
    };

    let rewritten = serde_json::to_vec(&json).map_err(|e| TemplateError::InvalidBody(e.to_string()))?;
    let headers = headers.with(CONTENT_LENGTH, rewritten.len().to_string());

    Ok(ExtractedPrompt {
        body: Bytes::from(rewritten),
        headers,
        prompts,
    })
}

fn rewrite_messages(json: &mut Value) -> Result<Vec<FormattedPrompt>, TemplateError> {
    let Some(messages) = json.get_mut("messages").and_then(Value::as_array_mut) else {
        return Ok(Vec::new());
    };

    let mut prompts = Vec::new();
    for (index, message) in messages.iter_mut().enumerate() {
        let Some(content) = message.get_mut("content") else {
            return Err(TemplateError::InvalidMessageContent { index });
        };
        match content {
            Value::String(_) => {}
            Value::Object(_) => {
                let prompt = parse_prompt(content.clone())?;
                *content = Value::String(render(&prompt)?);
                prompts.push(FormattedPrompt {
                    message_index: Some(index),
                    prompt,
                });
            }
            _ => return Err(TemplateError::InvalidMessageContent { index }),
        }
    }
    Ok(prompts)
}

fn rewrite_top_level_prompt(json: &mut Value) -> Result<Vec<FormattedPrompt>, TemplateError> {
    let raw = json
        .get("prompt")
        .cloned()
        .ok_or_else(|| TemplateError::InvalidPrompt("body has no `prompt` field".to_string()))?;

    // Clients may send the template object inline or as a JSON string
    let prompt = match raw {
        Value::String(text) => {
            let parsed: Value = serde_json::from_str(&text)
                .map_err(|e| TemplateError::InvalidPrompt(e.to_string()))?;
            parse_prompt(parsed)?
        }
        other => parse_prompt(other)?,
    };

    let rendered = render(&prompt)?;
    if let Some(slot) = json.get_mut("prompt") {
        *slot = Value::String(rendered);
    }

    Ok(vec![FormattedPrompt {
        message_index: None,
        prompt,
    }])
}

fn parse_prompt(value: Value) -> Result<Prompt, TemplateError> {
    serde_json::from_value(value).map_err(|e| TemplateError::InvalidPrompt(e.to_string()))
}

/// Names of every `{{name}}` placeholder in `text`, in order of appearance
pub fn placeholders(text: &str) -> Vec<&str> {
    PLACEHOLDER
        .captures_iter(text)
        .filter_map(|captures| captures.get(1))
        .map(|name| name.as_str())
        .collect()
}

/// Substitute every placeholder in the template with its value
pub fn render(prompt: &Prompt) -> Result<String, TemplateError> {
    let mut missing: Vec<String> = Vec::new();
    for name in placeholders(&prompt.template) {
        if !prompt.values.contains_key(name) && !missing.iter().any(|m| m == name) {
            missing.push(name.to_string());
        }
    }
    if !missing.is_empty() {
        return Err(TemplateError::MissingValues(missing));
    }

    let substitutions = prompt
        .values
        .iter()
        .map(|(name, value)| Ok((name.as_str(), value_text(name, value)?)))
        .collect::<Result<HashMap<&str, String>, TemplateError>>()?;

    let rendered = PLACEHOLDER
        .replace_all(&prompt.template, |captures: &regex::Captures<'_>| {
            substitutions
                .get(&captures[1])
                .cloned()
                .unwrap_or_else(|| captures[0].to_string())
        })
        .into_owned();

    let mut unresolved: Vec<String> = Vec::new();
    for name in placeholders(&rendered) {
        if !prompt.values.contains_key(name) && !unresolved.iter().any(|u| u == name) {
            unresolved.push(name.to_string());
        }
    }
    if !unresolved.is_empty() {
        return Err(TemplateError::UnresolvedPlaceholders(unresolved));
    }

    Ok(rendered)
}

fn value_text(name: &str, value: &Value) -> Result<String, TemplateError> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Number(_) | Value::Bool(_) | Value::Null => Ok(value.to_string()),
        Value::Array(_) | Value::Object(_) => Err(TemplateError::InvalidValue {
            name: name.to_string(),
        }),
    }
}
