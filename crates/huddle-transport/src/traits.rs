//! Connection abstraction for streaming sessions.
//!
//! A session only needs to push pre-encoded bytes to the client and notice
//! when the client goes away. Anything that can do both can carry a session.

use async_trait::async_trait;
use bytes::Bytes;
use huddle_protocol::{codec, Frame, ProtocolError};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A write did not complete in time.
    #[error("Write timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// An outbound streaming connection to one client.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send raw, already encoded bytes.
    ///
    /// May wait while the client is slow to read; callers bound it with a
    /// timeout.
    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Encode and send a frame.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let data = codec::encode(&frame)?;
        self.send_raw(data).await
    }

    /// Resolve once the client has gone away.
    async fn closed(&self);

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}
