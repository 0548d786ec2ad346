//! # huddle-protocol
//!
//! Wire framing for the Huddle event stream.
//!
//! Subscribers receive a `text/event-stream` body. This crate defines the
//! frames that make up that body and the codec that turns them into bytes
//! (and back, for clients and tests).
//!
//! ## Frame Types
//!
//! - `Event` - A named event with a JSON `data` payload and an optional id
//! - `Comment` - A no-op line, used for the handshake and keep-alives
//! - `Retry` - Reconnect delay hint for the client
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, Frame};
//!
//! let frame = Frame::event("meeting.deleted", r#"{"id":"m1"}"#).with_id(7);
//!
//! let encoded = codec::encode(&frame).unwrap();
//! assert_eq!(
//!     &encoded[..],
//!     b"id: 7\nevent: meeting.deleted\ndata: {\"id\":\"m1\"}\n\n"
//! );
//! assert_eq!(codec::decode(&encoded).unwrap(), frame);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{Frame, FrameType, KEEP_ALIVE};
