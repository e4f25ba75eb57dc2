//! Unified error response handling for the proxy service
//!
//! Client-caused errors are answered in plain text, rate limiting with the
//! JSON message and rate-limit headers, and everything the proxy could not
//! handle with the `helicone-message` JSON shape.

use crate::proxy::headers::{content_types, response as response_headers};
use crate::proxy::rate_limit::RATE_LIMITED_MESSAGE;
use crate::proxy::types::ProxyError;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Where clients are pointed for help with internal errors
pub const SUPPORT_MESSAGE: &str =
    "Please reach out on our discord or email us at help@helicone.ai, we'd love to help!";

/// JSON body of proxy faults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "helicone-message")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub support: Option<String>,
    #[serde(rename = "helicone-error")]
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            support: None,
            error: error.into(),
        }
    }

    /// The catch-all shape for faults inside the proxy
    pub fn internal(error: &impl std::fmt::Display) -> Self {
        Self {
            message: format!("Helicone ran into an error servicing your request: {error}"),
            support: Some(SUPPORT_MESSAGE.to_string()),
            error: error.to_string(),
        }
    }

    /// Convert to HTTP response with proper headers
    pub fn into_response_with_status(self, status: StatusCode) -> Response {
        let mut response = (status, Json(self)).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(content_types::JSON_UTF8),
        );
        headers.insert(
            response_headers::HELICONE_ERROR,
            HeaderValue::from_static("true"),
        );
        response
    }
}

/// Body of the 429 response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitedBody {
    pub message: String,
}

/// Extension trait for consistent error formatting
pub trait ErrorResponseExt {
    /// Get the appropriate HTTP status code
    fn status_code(&self) -> StatusCode;

    /// Render the full HTTP response
    fn to_http_response(&self) -> Response;
}

impl ErrorResponseExt for ProxyError {
    fn status_code(&self) -> StatusCode {
        use ProxyError::*;

        match self {
            Template(_) | CacheSettings(_) | RetrySettings(_) | RateLimitPolicy(_)
            | LoggingEndpoint(_) => StatusCode::BAD_REQUEST,
            MissingCredential => StatusCode::UNAUTHORIZED,
            RequestTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Upstream(_) | HttpError(_) | SerializationError(_) | Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn to_http_response(&self) -> Response {
        use ProxyError::*;

        let status = self.status_code();
        match self {
            Template(_) | CacheSettings(_) | RetrySettings(_) | RateLimitPolicy(_)
            | LoggingEndpoint(_) | MissingCredential => plain_text(status, self.to_string()),
            RateLimited(decision) => {
                let mut response = (
                    status,
                    Json(RateLimitedBody {
                        message: RATE_LIMITED_MESSAGE.to_string(),
                    }),
                )
                    .into_response();
                let headers = response.headers_mut();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static(content_types::JSON_UTF8),
                );
                for (name, value) in decision.header_pairs() {
                    if let Ok(value) = HeaderValue::from_str(&value) {
                        headers.insert(name, value);
                    }
                }
                response
            }
            RequestTooLarge { .. } => {
                ErrorResponse::new(self.to_string(), "request_too_large")
                    .into_response_with_status(status)
            }
            UpstreamTimeout(_) => ErrorResponse::new(self.to_string(), "upstream_timeout")
                .into_response_with_status(status),
            Upstream(_) | HttpError(_) | SerializationError(_) | Internal(_) => {
                ErrorResponse::internal(self).into_response_with_status(status)
            }
        }
    }
}

fn plain_text(status: StatusCode, message: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, content_types::TEXT_PLAIN)],
        message,
    )
        .into_response()
}

/// Error conversion for Axum responses
impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        self.to_http_response()
    }
}
