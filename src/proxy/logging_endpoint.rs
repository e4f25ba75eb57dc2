//! `POST /v1/log`: attach custom properties to an already logged request

use crate::domain::{LogEvent, RequestId};
use crate::proxy::headers::Headers;
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoggingEndpointError {
    #[error("Invalid logging request body: {0}")]
    InvalidBody(String),

    #[error("No helicone-id found in the request body")]
    MissingRequestId,

    #[error("No Helicone-Property-* headers found")]
    MissingProperties,
}

#[derive(Debug, Deserialize)]
struct PropertyUpdate {
    #[serde(rename = "helicone-id")]
    helicone_id: Option<String>,
}

/// Build the properties event from a logging request
pub fn property_update(body: &[u8], headers: &Headers) -> Result<LogEvent, LoggingEndpointError> {
    let update: PropertyUpdate = serde_json::from_slice(body)
        .map_err(|e| LoggingEndpointError::InvalidBody(e.to_string()))?;
    let request_id = update
        .helicone_id
        .and_then(|id| RequestId::try_new(id).ok())
        .ok_or(LoggingEndpointError::MissingRequestId)?;

    let properties = headers.properties();
    if properties.is_empty() {
        return Err(LoggingEndpointError::MissingProperties);
    }

    Ok(LogEvent::Properties {
        request_id,
        properties,
    })
}

/// Text returned to the caller once the update is queued
pub fn confirmation(properties: &BTreeMap<String, String>) -> String {
    let names: Vec<&str> = properties.keys().map(String::as_str).collect();
    format!("Successfully logged properties: {}", names.join(", "))
}
