//! Middleware implementations for the proxy service

use crate::domain::RequestId;
use crate::proxy::headers::{paths, response as response_headers, HELICONE_REQUEST_ID};
use crate::proxy::types::ProxyError;
use axum::{
    extract::{Request, State},
    http::{header, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Configuration for authentication middleware
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Paths that do not need an upstream credential
    pub bypass_paths: HashSet<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            bypass_paths: [paths::HEALTH, paths::LOG]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

fn request_id_of(request: &Request) -> String {
    request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Request ID middleware - resolves the id every log line and record carries
///
/// A client-supplied `Helicone-Request-Id` is honored; otherwise a v7 UUID is
/// generated. The id travels in request extensions and is echoed as
/// `Helicone-Id` unless the handler already set one (cache hits carry the id
/// of the request that filled the cache).
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = RequestId::from_header_or_generate(
        request
            .headers()
            .get(HELICONE_REQUEST_ID)
            .and_then(|h| h.to_str().ok()),
    );
    let header_value = HeaderValue::from_str(request_id.as_ref()).ok();
    request.extensions_mut().insert(request_id);

    let mut response = next.run(request).await;
    if let Some(value) = header_value {
        response
            .headers_mut()
            .entry(response_headers::HELICONE_ID)
            .or_insert(value);
    }
    response
}

/// Authentication middleware - every proxied request must carry a credential
/// for the upstream
pub async fn auth_middleware(
    State(auth_config): State<Arc<AuthConfig>>,
    request: Request,
    next: Next,
) -> Response {
    if auth_config.bypass_paths.contains(request.uri().path()) {
        return next.run(request).await;
    }

    let has_credential = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|value| !value.trim().is_empty());

    if !has_credential {
        warn!(request_id = %request_id_of(&request), "Missing Authorization header");
        return ProxyError::MissingCredential.into_response();
    }

    next.run(request).await
}

/// Logging middleware - logs request/response details with timing
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();

    let method = request.method().clone();
    let uri = request.uri().clone();
    let request_id = request_id_of(&request);

    info!(
        request_id = request_id,
        method = %method,
        path = %uri.path(),
        "Incoming request"
    );

    let response = next.run(request).await;
    let duration = start.elapsed();

    info!(
        request_id = request_id,
        method = %method,
        path = %uri.path(),
        status = response.status().as_u16(),
        duration_ms = duration.as_millis(),
        "Request completed"
    );

    response
}

/// Error logging for responses the proxy itself produced
///
/// Upstream errors pass through untouched; only responses flagged with
/// `helicone-error` or produced before forwarding are reported here.
pub async fn error_handling_middleware(request: Request, next: Next) -> Response {
    let request_id = request_id_of(&request);

    let response = next.run(request).await;
    let status = response.status();
    let proxied = response
        .headers()
        .contains_key(response_headers::HELICONE_STATUS);

    if !status.is_success() && !proxied {
        if status.is_server_error() || response.headers().contains_key(response_headers::HELICONE_ERROR) {
            tracing::error!(
                request_id = request_id,
                status = status.as_u16(),
                "Request failed"
            );
        } else {
            warn!(
                request_id = request_id,
                status = status.as_u16(),
                "Request rejected"
            );
        }
    }
    response
}
