//! Test utilities for proxy module testing
//!
//! Local axum servers stand in for the upstream API, and the proxy is wired to
//! in-memory stores and a [`MemoryLogSink`] so tests can inspect every log
//! event after draining background work.
