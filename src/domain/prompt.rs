//! Prompt templates as they appear in request bodies

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A `{{placeholder}}` template together with its substitution values
///
/// On the wire this is `{"prompt": "...", "values": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    #[serde(rename = "prompt")]
    pub template: String,
    #[serde(default)]
    pub values: Map<String, Value>,
}

/// A template that was rendered into the forwarded body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormattedPrompt {
    /// Position in `messages` for chat requests, `None` for a top-level `prompt`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_index: Option<usize>,
    pub prompt: Prompt,
}
