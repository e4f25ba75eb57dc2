//! Proxy module for handling LLM API requests
//!
//! Requests are forwarded to the upstream completion API with prompt
//! templating, bucketed response caching, rate limiting and retries layered
//! on top. Logging happens after the response has been handed back:
//! - Request path: settings, rate limit, cache, templates, forwarding
//! - Log path: body capture, stream consolidation, token accounting, sink

pub mod cache;
pub mod capture;
pub mod consolidation;
pub mod error_response;
pub mod headers;
pub mod log_path;
pub mod logging_endpoint;
pub mod middleware;
pub mod middleware_stack;
pub mod prompt;
pub mod rate_limit;
pub mod retry;
pub mod service;
pub mod test_utils;
pub mod tokens;
pub mod types;


#[cfg(test)]
mod integration_tests;

pub use middleware::AuthConfig;
pub use retry::{ReqwestUpstreamClient, UpstreamClient};
pub use service::{Collaborators, ProxyService};
pub use types::{ProxyConfig, ProxyError, ProxyResult};
