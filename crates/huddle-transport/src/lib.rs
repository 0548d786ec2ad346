//! # huddle-transport
//!
//! Streaming delivery for the Huddle notification hub.
//!
//! - **Connection** - What a session writes to: pre-encoded bytes out, and a
//!   signal when the client goes away
//! - **SSE** - A channel-backed `text/event-stream` connection
//! - **Session** - Handshake, write loop, heartbeat and teardown for one
//!   subscriber
//!
//! ```rust,ignore
//! use huddle_transport::{sse, Session, SessionConfig};
//!
//! let (conn, body) = sse::channel(16);
//! let session = Session::open(&hub, "team-a", conn, SessionConfig::default()).await?;
//! tokio::spawn(session.run());
//! // stream `body` to the client
//! ```

pub mod session;
pub mod sse;
pub mod traits;

pub use session::{Session, SessionConfig, SessionError, SessionHandle};
pub use sse::{SseBody, SseConnection};
pub use traits::{Connection, TransportError};
