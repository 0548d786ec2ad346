//! Server-sent events connection.
//!
//! [`channel`] splits a stream into a [`SseConnection`], written to by the
//! session task, and an [`SseBody`] the HTTP layer streams to the client.
//! Dropping the body (the client hung up) closes the connection.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::traits::{Connection, TransportError};

/// Default number of chunks buffered between the session and the body.
pub const DEFAULT_STREAM_BUFFER: usize = 16;

/// Create a connected pair with room for `buffer` pending chunks.
#[must_use]
pub fn channel(buffer: usize) -> (SseConnection, SseBody) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (
        SseConnection {
            tx,
            remote_addr: None,
        },
        SseBody { rx },
    )
}

/// Write half of an event stream.
#[derive(Debug)]
pub struct SseConnection {
    tx: mpsc::Sender<Bytes>,
    remote_addr: Option<String>,
}

impl SseConnection {
    /// Attach the client's address for logging.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }
}

#[async_trait]
impl Connection for SseConnection {
    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.tx
            .send(data)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn closed(&self) {
        self.tx.closed().await;
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }
}

/// Read half of an event stream: the chunks of a `text/event-stream`
/// response body.
#[derive(Debug)]
pub struct SseBody {
    rx: mpsc::Receiver<Bytes>,
}

impl Stream for SseBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}
