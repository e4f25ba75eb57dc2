//! Helicone proxy - an observability proxy for LLM completion APIs
//!
//! Requests are forwarded to the upstream API unchanged apart from prompt
//! templating, with optional response caching, rate limiting and retries.
//! Every exchange is logged after the client has its response.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod proxy;

pub use application::Application;
pub use error::{Error, Result};
