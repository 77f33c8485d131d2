//! Response sinks and the byte-stream plumbing between storage and client.
//!
//! A backend produces a [`ByteStream`] of stored (gzip) bytes. Serving is a
//! pipeline of independent stages: storage read, optional
//! [`gunzip`](super::compression::gunzip), then [`pipe`] into a
//! [`ResponseSink`]. Sinks apply their own flow control; the pipeline awaits
//! every chunk, so a slow client slows the storage read instead of growing a
//! buffer.

use std::pin::Pin;

use async_stream::stream;
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
    response::Response,
};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};

use super::error::CacheError;

/// Stream of raw bytes flowing out of storage or through a transform.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, CacheError>> + Send>>;

/// Status line and headers of a response, sent before any body bytes.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Destination of a cached response.
#[async_trait]
pub trait ResponseSink: Send {
    /// Commit the status and headers. May only happen once.
    async fn send_head(&mut self, head: ResponseHead) -> Result<(), CacheError>;

    /// Write one body chunk, waiting until the sink can take it.
    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), CacheError>;

    /// Mark the body complete.
    async fn finish(&mut self) -> Result<(), CacheError>;

    /// Terminate a committed response abnormally so the client does not
    /// mistake a truncated body for a complete one.
    async fn abort(&mut self, reason: &CacheError);

    /// Whether the head has been committed.
    fn head_sent(&self) -> bool;
}

/// Copy `stream` into `sink` and finish it. Returns the number of body bytes.
pub async fn pipe(stream: ByteStream, sink: &mut dyn ResponseSink) -> Result<u64, CacheError> {
    let mut stream = stream;
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }
        written = written.saturating_add(chunk.len() as u64);
        sink.send_chunk(chunk).await?;
    }

    sink.finish().await?;
    Ok(written)
}

// ============================================================================
// Channel sink: feeds an axum response body
// ============================================================================

type BodyItem = Result<Bytes, std::io::Error>;

/// Sink backed by a bounded channel whose receiver becomes an HTTP body.
///
/// A full channel suspends the writer. A dropped receiver (client went away)
/// surfaces as [`CacheError::Disconnected`], which ends the storage read.
pub struct ChannelSink {
    head: Option<oneshot::Sender<ResponseHead>>,
    body: Option<mpsc::Sender<BodyItem>>,
    head_sent: bool,
}

/// Receiving half of a [`ChannelSink`].
pub struct PendingResponse {
    head: oneshot::Receiver<ResponseHead>,
    body: mpsc::Receiver<BodyItem>,
}

/// Create a connected sink / response pair holding at most `capacity` chunks
/// in flight.
pub fn channel_sink(capacity: usize) -> (ChannelSink, PendingResponse) {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(capacity.max(1));
    (
        ChannelSink {
            head: Some(head_tx),
            body: Some(body_tx),
            head_sent: false,
        },
        PendingResponse {
            head: head_rx,
            body: body_rx,
        },
    )
}

#[async_trait]
impl ResponseSink for ChannelSink {
    async fn send_head(&mut self, head: ResponseHead) -> Result<(), CacheError> {
        let sender = self
            .head
            .take()
            .ok_or_else(|| CacheError::transport("response head already sent"))?;
        sender
            .send(head)
            .map_err(|_| CacheError::disconnected("before response head"))?;
        self.head_sent = true;
        Ok(())
    }

    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), CacheError> {
        if !self.head_sent {
            return Err(CacheError::transport("body chunk before response head"));
        }
        let sender = self
            .body
            .as_ref()
            .ok_or_else(|| CacheError::transport("response body already finished"))?;
        sender
            .send(Ok(chunk))
            .await
            .map_err(|_| CacheError::disconnected("mid-response"))
    }

    async fn finish(&mut self) -> Result<(), CacheError> {
        self.body = None;
        Ok(())
    }

    async fn abort(&mut self, reason: &CacheError) {
        if let Some(sender) = self.body.take() {
            let _ = sender
                .send(Err(std::io::Error::other(reason.to_string())))
                .await;
        }
    }

    fn head_sent(&self) -> bool {
        self.head_sent
    }
}

impl PendingResponse {
    /// Wait for the head and build a streaming response.
    ///
    /// Returns `None` when the sink was dropped without committing a head,
    /// i.e. nothing was served.
    pub async fn into_response(self) -> Option<Response> {
        let head = self.head.await.ok()?;
        let mut body = self.body;
        let chunks = stream! {
            while let Some(item) = body.recv().await {
                yield item;
            }
        };

        let mut response = Response::new(Body::from_stream(chunks));
        *response.status_mut() = head.status;
        *response.headers_mut() = head.headers;
        Some(response)
    }
}

// ============================================================================
// Memory sink: buffers the whole response
// ============================================================================

/// Sink that keeps the response in memory. Useful for embedding hosts that
/// post-process responses, and for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    head: Option<ResponseHead>,
    body: BytesMut,
    finished: bool,
    aborted: Option<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Option<&ResponseHead> {
        self.head.as_ref()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.aborted.as_deref()
    }
}

#[async_trait]
impl ResponseSink for MemorySink {
    async fn send_head(&mut self, head: ResponseHead) -> Result<(), CacheError> {
        if self.head.is_some() {
            return Err(CacheError::transport("response head already sent"));
        }
        self.head = Some(head);
        Ok(())
    }

    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), CacheError> {
        if self.head.is_none() {
            return Err(CacheError::transport("body chunk before response head"));
        }
        self.body.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), CacheError> {
        self.finished = true;
        Ok(())
    }

    async fn abort(&mut self, reason: &CacheError) {
        self.aborted = Some(reason.to_string());
    }

    fn head_sent(&self) -> bool {
        self.head.is_some()
    }
}
