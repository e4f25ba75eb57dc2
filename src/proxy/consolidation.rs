//! Reassembly of streamed completion responses
//!
//! A streamed body is a sequence of `data: {json}` lines ending with a
//! terminator line. The chunks are merged into the shape a non-streamed
//! request would have returned, and the raw chunks are kept alongside as
//! `streamed_data`.

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

/// Field holding the raw chunk sequence on a consolidated body
pub const STREAMED_DATA: &str = "streamed_data";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsolidationError {
    #[error("Stream contained no chunks")]
    Empty,

    #[error("Chunk {0} has a malformed `choices` field")]
    MalformedChoices(usize),
}

/// A response body as it will be logged
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    Json(Value),
    /// The body could not be parsed; the raw text is kept for diagnostics
    Unparsed { raw: String, error: String },
}

impl ParsedResponse {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Unparsed { .. } => None,
        }
    }

    /// The raw chunks of a consolidated stream
    pub fn streamed_chunks(&self) -> Option<&[Value]> {
        self.as_json()?
            .get(STREAMED_DATA)?
            .as_array()
            .map(Vec::as_slice)
    }

    pub fn into_value(self) -> Value {
        match self {
            Self::Json(value) => value,
            Self::Unparsed { raw, error } => serde_json::json!({
                "helicone_error": "error parsing response",
                "parse_response_error": error,
                "body": raw,
            }),
        }
    }
}

/// Parse a captured response body for logging
///
/// Only successful streamed responses are consolidated; everything else is
/// expected to be a single JSON document.
pub fn parse_response(body: &[u8], streamed: bool, status: u16) -> ParsedResponse {
    let text = String::from_utf8_lossy(body);
    if !streamed || status != 200 {
        return match serde_json::from_str(&text) {
            Ok(value) => ParsedResponse::Json(value),
            Err(e) => ParsedResponse::Unparsed {
                raw: text.into_owned(),
                error: e.to_string(),
            },
        };
    }
    consolidate_stream(&text)
}

/// Split a streamed body into JSON chunks
///
/// Empty lines are dropped and the final line is always treated as the
/// stream terminator and replaced by `{}`.
pub fn parse_stream_lines(text: &str) -> Result<Vec<Value>, serde_json::Error> {
    let lines: Vec<&str> = text
        .split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let last = lines.len().saturating_sub(1);

    lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            if i == last {
                return Ok(Value::Object(Map::new()));
            }
            let payload = line.strip_prefix("data:").unwrap_or(line).trim();
            serde_json::from_str(payload)
        })
        .collect()
}

/// Parse and merge a streamed body, falling back to the first chunk when
/// merging fails
pub fn consolidate_stream(text: &str) -> ParsedResponse {
    let chunks = match parse_stream_lines(text) {
        Ok(chunks) => chunks,
        Err(e) => {
            return ParsedResponse::Unparsed {
                raw: text.to_string(),
                error: e.to_string(),
            }
        }
    };

    let merged = match consolidate_chunks(&chunks) {
        Ok(merged) => merged,
        Err(e) => {
            warn!(error = %e, chunks = chunks.len(), "Falling back to first stream chunk");
            chunks
                .first()
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()))
        }
    };

    let mut object = match merged {
        Value::Object(object) => object,
        other => {
            let mut wrapper = Map::new();
            wrapper.insert("body".to_string(), other);
            wrapper
        }
    };
    object.insert(STREAMED_DATA.to_string(), Value::Array(chunks));
    ParsedResponse::Json(Value::Object(object))
}

/// Merge chunks into one response object
///
/// The first chunk carrying `choices` is the skeleton. Every later chunk's
/// choices are matched by `index` (or by position when absent) and their
/// `delta.content` or `text` appended. Afterwards `delta` choices become
/// `message` choices.
pub fn consolidate_chunks(chunks: &[Value]) -> Result<Value, ConsolidationError> {
    let skeleton_position = chunks
        .iter()
        .position(|chunk| chunk.get("choices").is_some())
        .ok_or(ConsolidationError::Empty)?;

    let mut merged = chunks[skeleton_position].clone();
    for (offset, chunk) in chunks[skeleton_position + 1..].iter().enumerate() {
        let Some(choices) = chunk.get("choices") else {
            continue;
        };
        let choices = choices
            .as_array()
            .ok_or(ConsolidationError::MalformedChoices(skeleton_position + 1 + offset))?;
        let target = merged
            .get_mut("choices")
            .and_then(Value::as_array_mut)
            .ok_or(ConsolidationError::MalformedChoices(skeleton_position))?;

        for (position, choice) in choices.iter().enumerate() {
            let index = choice_index(choice, position);
            let existing = target
                .iter()
                .enumerate()
                .position(|(p, c)| choice_index(c, p) == index);
            match existing {
                Some(p) => merge_choice(&mut target[p], choice),
                None => target.push(choice.clone()),
            }
        }
    }

    if let Some(choices) = merged.get_mut("choices").and_then(Value::as_array_mut) {
        for choice in choices.iter_mut() {
            delta_to_message(choice);
        }
    }
    Ok(merged)
}

fn choice_index(choice: &Value, position: usize) -> u64 {
    choice
        .get("index")
        .and_then(Value::as_u64)
        .unwrap_or(position as u64)
}

fn merge_choice(target: &mut Value, incoming: &Value) {
    let Some(target) = target.as_object_mut() else {
        return;
    };

    if let Some(delta) = incoming.get("delta") {
        let piece = delta.get("content").and_then(Value::as_str).unwrap_or("");
        let entry = target
            .entry("delta")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(existing) = entry.as_object_mut() {
            append_text(existing, "content", piece);
            // Later deltas may carry fields the first one lacked
            if let Some(incoming) = delta.as_object() {
                for (key, value) in incoming {
                    if key != "content" && !existing.contains_key(key) {
                        existing.insert(key.clone(), value.clone());
                    }
                }
            }
        }
    } else if let Some(piece) = incoming.get("text").and_then(Value::as_str) {
        append_text(target, "text", piece);
    }

    if let Some(finish_reason) = incoming.get("finish_reason").filter(|v| !v.is_null()) {
        target.insert("finish_reason".to_string(), finish_reason.clone());
    }
}

fn append_text(object: &mut Map<String, Value>, field: &str, piece: &str) {
    let mut text = object
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    text.push_str(piece);
    object.insert(field.to_string(), Value::String(text));
}

fn delta_to_message(choice: &mut Value) {
    let Some(object) = choice.as_object_mut() else {
        return;
    };
    if let Some(delta) = object.remove("delta") {
        let mut message = match delta {
            Value::Object(message) => message,
            _ => Map::new(),
        };
        message
            .entry("content")
            .or_insert_with(|| Value::String(String::new()));
        object.insert("message".to_string(), Value::Object(message));
    }
}
