//! Streaming primitives shared by the transport, decoder and projector.
//!
//! Contract:
//! - The transport returns either a fully buffered body or an open byte source.
//! - A byte source decodes into 0..n `Chunk` events, optionally followed by `Done`.
//! - A decoded stream ends after the first error item (`Stream` or `Timeout`).

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;

use crate::error::CoreResult;
use crate::model::CompletionChunk;

/// One decoded upstream record.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// An SSE frame carrying an incremental delta and/or metadata.
    Chunk(CompletionChunk),
    /// A buffered (non-streaming) body carrying the full message at once.
    Snapshot(CompletionChunk),
    /// The `[DONE]` sentinel.
    Done,
}

impl UpstreamEvent {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// Boxed sequence of decoded upstream events.
pub type UpstreamEvents = BoxStream<'static, CoreResult<UpstreamEvent>>;

/// What one upstream call produced.
pub enum UpstreamResponse {
    Buffered(CompletionChunk),
    Streaming(ByteSource),
}

impl UpstreamResponse {
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming(_))
    }

    /// View either shape as an event sequence. A buffered body becomes a
    /// `Snapshot` followed by `Done`.
    pub fn into_events(self) -> UpstreamEvents {
        match self {
            Self::Buffered(payload) => Box::pin(stream::iter([
                Ok(UpstreamEvent::Snapshot(payload)),
                Ok(UpstreamEvent::Done),
            ])),
            Self::Streaming(source) => Box::pin(crate::sse::SseEventStream::new(source)),
        }
    }
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered(p) => f.debug_tuple("Buffered").field(p).finish(),
            Self::Streaming(s) => f.debug_tuple("Streaming").field(&s.deadline).finish(),
        }
    }
}

/// An open response body bounded by the call deadline. Holds the pool slot
/// of the request that opened it until dropped.
pub struct ByteSource {
    inner: BoxStream<'static, CoreResult<Bytes>>,
    pub(crate) deadline: Instant,
    _permit: Option<OwnedSemaphorePermit>,
}

impl ByteSource {
    pub fn new(
        inner: BoxStream<'static, CoreResult<Bytes>>,
        deadline: Instant,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            inner,
            deadline,
            _permit: permit,
        }
    }

    /// In-memory source, mostly for tests and the offline CLI path.
    pub fn from_chunks<I, B>(chunks: I, deadline: Instant) -> Self
    where
        I: IntoIterator<Item = B>,
        I::IntoIter: Send + 'static,
        B: Into<Bytes>,
    {
        let items = chunks.into_iter().map(|c| Ok(c.into()));
        Self::new(Box::pin(stream::iter(items)), deadline, None)
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Stream for ByteSource {
    type Item = CoreResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn buffered_becomes_snapshot_then_done() {
        let payload: CompletionChunk = serde_json::from_value(serde_json::json!({
            "choices": [{"message": {"content": "hi"}}]
        }))
        .unwrap();
        let events: Vec<_> = UpstreamResponse::Buffered(payload.clone())
            .into_events()
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap(), &UpstreamEvent::Snapshot(payload));
        assert!(events[1].as_ref().unwrap().is_done());
    }

    #[tokio::test]
    async fn byte_source_yields_chunks_in_order() {
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        let src = ByteSource::from_chunks(vec!["ab", "cd"], deadline);
        assert_eq!(src.deadline(), deadline);
        let got: Vec<Bytes> = src.map(|r| r.unwrap()).collect().await;
        assert_eq!(got, vec![Bytes::from("ab"), Bytes::from("cd")]);
    }
}
