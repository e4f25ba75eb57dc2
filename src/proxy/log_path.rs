//! Deferred logging of proxied exchanges
//!
//! Everything that happens after the client has its response runs here:
//! waiting for the captured body, consolidating streams, token accounting
//! and writing events to the sink. Tasks are tracked so shutdown can wait
//! for in-flight logs.

use crate::domain::{LogEvent, LogRecord, RequestLog, ResponseLog, Usage};
use crate::infrastructure::LogSink;
use crate::proxy::capture::{BodyCapture, CapturedBody};
use crate::proxy::consolidation::parse_response;
use crate::proxy::tokens::{annotate_usage, compute_usage, lacks_completion_usage};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn, Instrument};

/// Background work after the response has been handed to the client
#[derive(Clone)]
pub struct LogPath {
    sink: Arc<dyn LogSink>,
    tracker: TaskTracker,
}

impl LogPath {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink,
            tracker: TaskTracker::new(),
        }
    }

    /// Run `future` detached from the request, tracked for shutdown
    pub fn spawn<F>(&self, task: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker
            .spawn(future.instrument(tracing::debug_span!("background", task)));
    }

    /// Write one event; sink failures are logged and swallowed
    pub async fn write(&self, event: LogEvent) {
        let request_id = event.request_id().clone();
        if let Err(e) = self.sink.write(event).await {
            error!(request_id = %request_id, error = %e, "Failed to write log event");
        }
    }

    pub fn write_in_background(&self, event: LogEvent) {
        let path = self.clone();
        self.spawn("log_event", async move { path.write(event).await });
    }

    /// Tasks still running
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Wait up to `timeout` for all tracked tasks
    ///
    /// Returns false when tasks were still running at the deadline. The
    /// tracker accepts new tasks again afterwards.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let drained = tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok();
        self.tracker.reopen();
        if !drained {
            warn!(pending = self.tracker.len(), "Background tasks still running after drain timeout");
        }
        drained
    }
}

/// A forwarded exchange whose response body is still streaming
pub struct PendingExchange {
    pub request: RequestLog,
    pub status: u16,
    pub started: Instant,
    pub capture: BodyCapture,
}

/// The assembled record plus the body the client received
#[derive(Debug, Clone)]
pub struct FinishedExchange {
    pub record: LogRecord,
    pub body: CapturedBody,
}

impl PendingExchange {
    /// Wait for the body (at most `ceiling`) and build the log record
    pub async fn finish(self, ceiling: Duration) -> FinishedExchange {
        let outcome = self.capture.wait(ceiling).await;
        let delay_ms = self.started.elapsed().as_millis() as u64;
        let streamed = self.request.streamed;

        let parsed = parse_response(&outcome.body.bytes, streamed, self.status);
        let chunks = parsed.streamed_chunks().map(<[_]>::to_vec);
        let mut body = parsed.into_value();
        let mut usage = Usage::from_response_body(&body);

        if streamed && lacks_completion_usage(&body) {
            if let (Some(chunks), Some(request_body)) = (chunks, self.request.body.as_ref()) {
                match compute_usage(request_body, &chunks) {
                    Ok(calculated) => {
                        annotate_usage(&mut body, &calculated);
                        usage = Some(calculated);
                    }
                    Err(e) => {
                        debug!(request_id = %self.request.id, error = %e, "Could not count stream tokens")
                    }
                }
            }
        }

        FinishedExchange {
            record: LogRecord {
                request: self.request,
                response: ResponseLog {
                    status: self.status,
                    delay_ms,
                    body,
                    timed_out: outcome.timed_out,
                    usage,
                },
            },
            body: outcome.body,
        }
    }
}

/// Record for an exchange that never got an upstream response
pub fn failed_exchange(request: RequestLog, status: u16, message: &str, started: Instant) -> LogRecord {
    LogRecord {
        request,
        response: ResponseLog {
            status,
            delay_ms: started.elapsed().as_millis() as u64,
            body: serde_json::json!({ "helicone_error": message }),
            timed_out: false,
            usage: None,
        },
    }
}
