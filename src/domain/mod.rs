//! Domain types for the proxy
//!
//! Identifiers, prompt templates and the log records the proxy emits.

pub mod log_record;
pub mod prompt;
pub mod types;

pub use log_record::*;
pub use prompt::*;
pub use types::*;
