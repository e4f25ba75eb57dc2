//! Response body capture
//!
//! The upstream body is streamed to the client chunk by chunk while a copy
//! accumulates for logging. A oneshot channel is completed exactly once when
//! the stream ends, fails or is dropped (client disconnect), so the log task
//! can wait for the body without holding up the client.

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::warn;

/// Chunks shorter than this are merged into the next one when a client asks
/// for `Helicone-FF-Stream-Force-Format`
pub const FORCE_FORMAT_MIN_CHUNK: usize = 50;

/// The body as seen by the tee when the stream finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedBody {
    pub bytes: Bytes,
    /// The stream reached its end without error
    pub complete: bool,
}

/// What the log task gets after waiting on a capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOutcome {
    pub body: CapturedBody,
    /// The wait hit its ceiling and `body` is whatever had arrived by then
    pub timed_out: bool,
}

struct TeeState {
    buffer: Arc<Mutex<BytesMut>>,
    done: Option<oneshot::Sender<CapturedBody>>,
}

impl TeeState {
    fn finish(&mut self, complete: bool) {
        if let Some(done) = self.done.take() {
            let bytes = self.buffer.lock().clone().freeze();
            // The receiver may already be gone; nothing left to notify
            let _ = done.send(CapturedBody { bytes, complete });
        }
    }
}

impl Drop for TeeState {
    fn drop(&mut self) {
        self.finish(false);
    }
}

pin_project! {
    /// Stream adapter that copies every chunk into the capture buffer
    pub struct TeeStream<S> {
        #[pin]
        inner: S,
        state: TeeState,
    }
}

impl<S, E> Stream for TeeStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.state.buffer.lock().extend_from_slice(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.state.finish(false);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.state.finish(true);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Receiving side of a tee
pub struct BodyCapture {
    buffer: Arc<Mutex<BytesMut>>,
    done: oneshot::Receiver<CapturedBody>,
}

impl BodyCapture {
    /// Wait for the stream to finish, at most `ceiling`
    ///
    /// On timeout the partially accumulated body is returned.
    pub async fn wait(self, ceiling: Duration) -> CaptureOutcome {
        match tokio::time::timeout(ceiling, self.done).await {
            Ok(Ok(body)) => CaptureOutcome {
                body,
                timed_out: false,
            },
            Ok(Err(_)) => CaptureOutcome {
                body: CapturedBody {
                    bytes: self.buffer.lock().clone().freeze(),
                    complete: false,
                },
                timed_out: false,
            },
            Err(_) => {
                warn!(
                    ceiling_secs = ceiling.as_secs(),
                    "Response body capture timed out, logging partial body"
                );
                CaptureOutcome {
                    body: CapturedBody {
                        bytes: self.buffer.lock().clone().freeze(),
                        complete: false,
                    },
                    timed_out: true,
                }
            }
        }
    }
}

/// Split `inner` into a client-facing stream and a capture handle
pub fn tee<S>(inner: S) -> (TeeStream<S>, BodyCapture) {
    let buffer = Arc::new(Mutex::new(BytesMut::new()));
    let (sender, receiver) = oneshot::channel();
    let stream = TeeStream {
        inner,
        state: TeeState {
            buffer: buffer.clone(),
            done: Some(sender),
        },
    };
    (
        stream,
        BodyCapture {
            buffer,
            done: receiver,
        },
    )
}

/// Merge chunks shorter than `min_len` into the following chunk; whatever is
/// left is flushed when the stream ends
pub fn coalesce_small_chunks<S, E>(
    inner: S,
    min_len: usize,
) -> impl Stream<Item = Result<Bytes, E>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin,
    E: Send,
{
    stream::unfold(
        (inner, BytesMut::new(), false),
        move |(mut inner, mut pending, finished)| async move {
            if finished {
                return None;
            }
            loop {
                match inner.next().await {
                    Some(Ok(chunk)) => {
                        pending.extend_from_slice(&chunk);
                        if pending.len() >= min_len {
                            let out = pending.split().freeze();
                            return Some((Ok(out), (inner, pending, false)));
                        }
                    }
                    Some(Err(e)) => return Some((Err(e), (inner, pending, true))),
                    None if pending.is_empty() => return None,
                    None => {
                        let out = pending.split().freeze();
                        return Some((Ok(out), (inner, pending, true)));
                    }
                }
            }
        },
    )
}
