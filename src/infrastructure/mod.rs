//! Infrastructure layer for the proxy
//!
//! The external collaborators: counter storage for rate limits, response
//! storage for the cache and the log sink, each behind a trait with an
//! in-process implementation.

pub mod kv_store;
pub mod log_sink;
pub mod response_store;

pub use kv_store::{CounterStore, InMemoryCounterStore, StoreError};
pub use log_sink::{JsonLinesLogSink, LogSink, LogSinkError, MemoryLogSink, TracingLogSink};
pub use response_store::{CachedResponse, InMemoryResponseStore, ResponseStore};
