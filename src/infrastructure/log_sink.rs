//! Destinations for proxy log events
//!
//! The proxy never surfaces sink failures to clients; callers log them and
//! move on.

use crate::domain::LogEvent;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum LogSinkError {
    #[error("Failed to serialize log event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to write log event to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write(&self, event: LogEvent) -> Result<(), LogSinkError>;
}

/// Emits every event as a structured `tracing` record
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

#[async_trait]
impl LogSink for TracingLogSink {
    async fn write(&self, event: LogEvent) -> Result<(), LogSinkError> {
        let payload = serde_json::to_string(&event)?;
        match &event {
            LogEvent::Request(record) => info!(
                target: "helicone_proxy::log_sink",
                request_id = %record.request.id,
                status = record.response.status,
                delay_ms = record.response.delay_ms,
                streamed = record.request.streamed,
                event = %payload,
                "Request logged"
            ),
            LogEvent::CacheHit { request_id, .. } => info!(
                target: "helicone_proxy::log_sink",
                request_id = %request_id,
                event = %payload,
                "Cache hit logged"
            ),
            LogEvent::Properties { request_id, .. } => info!(
                target: "helicone_proxy::log_sink",
                request_id = %request_id,
                event = %payload,
                "Properties logged"
            ),
        }
        Ok(())
    }
}

/// Appends one JSON object per line to a file
pub struct JsonLinesLogSink {
    path: PathBuf,
    file: tokio::sync::Mutex<File>,
}

impl JsonLinesLogSink {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, LogSinkError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| LogSinkError::Io {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LogSink for JsonLinesLogSink {
    async fn write(&self, event: LogEvent) -> Result<(), LogSinkError> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        let io_error = |source| LogSinkError::Io {
            path: self.path.clone(),
            source,
        };
        file.write_all(&line).await.map_err(io_error)?;
        file.flush().await.map_err(io_error)
    }
}

/// Keeps events in memory; used by tests and embedders that inspect logs
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    events: parking_lot::Mutex<Vec<LogEvent>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().clone()
    }

    pub fn request_records(&self) -> Vec<crate::domain::LogRecord> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                LogEvent::Request(record) => Some(record.as_ref().clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn write(&self, event: LogEvent) -> Result<(), LogSinkError> {
        self.events.lock().push(event);
        Ok(())
    }
}
