//! SSE streaming transport
//!
//! A bounded byte-chunk queue between the generation task (producer) and the
//! HTTP response body (consumer). The producer blocks when the queue is full.
//! An empty chunk is the end-of-stream sentinel and is always the last thing
//! the producer task enqueues.
//!
//! The per-chunk timeout only runs once the session accepted the prompt.
//! Before that the producer is queued on the generation lock or waiting for
//! readiness, both of which end in frames or the sentinel on their own.

use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use futures_util::FutureExt;
use inference::{FragmentSink, GenerationRequest, SharedBridge};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::format::{self, ResponseContext};

/// Create a bounded SSE queue for one response
pub fn sse_channel(capacity: usize, ctx: ResponseContext) -> (SseProducer, SseConsumer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (started_tx, started_rx) = oneshot::channel();
    (
        SseProducer {
            tx,
            ctx,
            started: Some(started_tx),
            closed: false,
        },
        SseConsumer {
            rx,
            started: Some(started_rx),
        },
    )
}

/// Frame a serializable value as `data: <json>\n\n`
pub fn sse_frame<T: Serialize>(value: &T) -> Bytes {
    match serde_json::to_string(value) {
        Ok(json) => Bytes::from(format!("data: {}\n\n", json)),
        Err(e) => {
            log::error!("Failed to serialize SSE frame: {}", e);
            Bytes::new()
        }
    }
}

/// Writing half, owned by the generation task
pub struct SseProducer {
    tx: mpsc::Sender<Bytes>,
    ctx: ResponseContext,
    /// Arms the consumer's chunk timeout
    started: Option<oneshot::Sender<()>>,
    /// Set once the consumer went away; later sends are dropped
    closed: bool,
}

impl SseProducer {
    async fn send(&mut self, frame: Bytes) {
        if self.closed || frame.is_empty() {
            return;
        }
        if self.tx.send(frame).await.is_err() {
            log::debug!("Stream consumer closed, dropping remaining frames");
            self.closed = true;
        }
    }

    /// Final `stop` chunk followed by `data: [DONE]`
    pub async fn send_done(&mut self) {
        let last = sse_frame(&format::final_chunk(&self.ctx));
        self.send(last).await;
        self.send(Bytes::from_static(b"data: [DONE]\n\n")).await;
    }

    /// Best-effort inline error object
    pub async fn send_error(&mut self, message: &str) {
        let frame = sse_frame(&format::error_body(message));
        self.send(frame).await;
    }

    /// Enqueue the end-of-stream sentinel
    pub async fn finish(self) {
        if !self.closed {
            let _ = self.tx.send(Bytes::new()).await;
        }
    }
}

#[async_trait]
impl FragmentSink for SseProducer {
    async fn started(&mut self) {
        if let Some(started) = self.started.take() {
            let _ = started.send(());
        }
    }

    async fn push(&mut self, fragment: &str) {
        let frame = sse_frame(&format::content_chunk(&self.ctx, fragment));
        self.send(frame).await;
    }
}

/// Reading half, turned into the response body
pub struct SseConsumer {
    rx: mpsc::Receiver<Bytes>,
    /// `None` once generation started (or the producer went away)
    started: Option<oneshot::Receiver<()>>,
}

enum Next {
    Chunk(Bytes),
    /// Error frame written after a chunk timeout; nothing follows it
    TimedOut(Bytes),
    End,
}

impl SseConsumer {
    async fn next(&mut self, chunk_timeout: Duration) -> Next {
        loop {
            if let Some(started) = self.started.as_mut() {
                tokio::select! {
                    chunk = self.rx.recv() => return Self::accept(chunk),
                    _ = started => self.started = None,
                }
                continue;
            }

            return match tokio::time::timeout(chunk_timeout, self.rx.recv()).await {
                Ok(chunk) => Self::accept(chunk),
                Err(_) => {
                    log::warn!(
                        "No stream chunk within {}s, closing response",
                        chunk_timeout.as_secs()
                    );
                    let message = format!("Stream timed out after {}s", chunk_timeout.as_secs());
                    Next::TimedOut(sse_frame(&format::error_body(&message)))
                }
            };
        }
    }

    fn accept(chunk: Option<Bytes>) -> Next {
        match chunk {
            Some(chunk) if !chunk.is_empty() => Next::Chunk(chunk),
            _ => Next::End,
        }
    }

    /// Streaming body that ends on the sentinel, a closed queue, or with an
    /// error frame when no chunk arrives within `chunk_timeout` of the
    /// previous one once generation started.
    pub fn into_body(self, chunk_timeout: Duration) -> Body {
        let chunks = futures_util::stream::unfold(Some(self), move |state| async move {
            let mut consumer = state?;
            match consumer.next(chunk_timeout).await {
                Next::Chunk(chunk) => Some((Ok::<_, Infallible>(chunk), Some(consumer))),
                Next::TimedOut(frame) => Some((Ok(frame), None)),
                Next::End => None,
            }
        });
        Body::from_stream(chunks)
    }
}

/// Run a generation on its own task, feeding `producer`.
///
/// Success ends with the final chunk and `[DONE]`, failure with an error
/// frame. The sentinel is enqueued on every path, panics included.
pub fn spawn_generation(
    bridge: SharedBridge,
    request: GenerationRequest,
    mut producer: SseProducer,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let outcome = AssertUnwindSafe(bridge.generate_into(request, &mut producer))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => {
                log::debug!(
                    "Stream {} finished with {} fragments",
                    producer.ctx.id,
                    result.completion_tokens
                );
                producer.send_done().await;
            }
            Ok(Err(e)) => producer.send_error(&e.to_string()).await,
            Err(_) => {
                log::error!("Generation task panicked");
                bridge.logs().push("Generation failed: internal panic");
                producer.send_error("Generation failed: internal panic").await;
            }
        }

        producer.finish().await;
    })
}
