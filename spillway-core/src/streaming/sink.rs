//! Output seam between the chunk loop and the HTTP response body.
//!
//! The engine never touches the HTTP framing directly; it writes into a
//! [`ByteSink`], and the production sink bridges to an `axum` body over a
//! bounded channel. Dropping the body (the client hung up) closes the
//! channel, which is how disconnection reaches the engine.

use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use futures::stream;
use tokio::sync::mpsc;

/// Chunks buffered between the engine and the HTTP body.
const BODY_CHANNEL_DEPTH: usize = 8;

/// The receiving side of the response went away.
#[derive(Debug, thiserror::Error)]
#[error("client disconnected")]
pub struct SinkClosed;

/// Destination for streamed file bytes.
#[async_trait]
pub trait ByteSink: Send {
    /// Delivers one chunk; chunks arrive in ascending offset order.
    ///
    /// # Errors
    ///
    /// Returns `SinkClosed` once the consumer is gone.
    async fn send(&mut self, chunk: Bytes) -> Result<(), SinkClosed>;

    /// Resolves when the consumer has gone away, letting callers abandon
    /// upstream fetches and flood-wait sleeps promptly.
    async fn closed(&self);
}

/// [`ByteSink`] bridged to an `axum` response body.
pub struct BodySink {
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
}

impl BodySink {
    /// Creates the sink and the response body it feeds.
    pub fn channel() -> (Self, Body) {
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
        let body = Body::from_stream(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }));
        (Self { tx }, body)
    }
}

#[async_trait]
impl ByteSink for BodySink {
    async fn send(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
        self.tx.send(Ok(chunk)).await.map_err(|_| SinkClosed)
    }

    async fn closed(&self) {
        self.tx.closed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_body_receives_sent_chunks() {
        let (mut sink, body) = BodySink::channel();

        sink.send(Bytes::from_static(b"hello ")).await.unwrap();
        sink.send(Bytes::from_static(b"world")).await.unwrap();
        drop(sink);

        let collected = axum::body::to_bytes(body, 64).await.unwrap();
        assert_eq!(&collected[..], b"hello world");
    }

    #[tokio::test]
    async fn test_dropped_body_closes_sink() {
        let (mut sink, body) = BodySink::channel();
        drop(body);

        sink.closed().await;
        assert!(sink.send(Bytes::from_static(b"late")).await.is_err());
    }
}
