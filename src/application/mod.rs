//! Application wiring
//!
//! Builds the collaborators from settings, serves the proxy router and
//! drains pending request logs on shutdown.

pub mod app;

pub use app::Application;
