//! Frame types for the Huddle event stream.
//!
//! A frame is one block of a server-sent event stream, terminated by a
//! blank line on the wire.

/// Comment text written by the session heartbeat.
pub const KEEP_ALIVE: &str = "keep-alive";

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Event,
    Comment,
    Retry,
}

impl FrameType {
    /// Get a static label for logging and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Event => "event",
            FrameType::Comment => "comment",
            FrameType::Retry => "retry",
        }
    }
}

/// A stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A named event delivered to the client's `EventSource` listeners.
    Event {
        /// Optional event id, echoed by browsers as `Last-Event-ID`.
        id: Option<u64>,
        /// Event name (the `event:` field).
        event: String,
        /// Event data, usually a JSON document. May span several lines.
        data: String,
    },

    /// A comment line. Clients ignore these; they keep intermediaries
    /// from timing out an idle stream.
    Comment {
        /// Comment text.
        text: String,
    },

    /// Reconnect delay hint.
    Retry {
        /// Delay in milliseconds.
        millis: u64,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Event { .. } => FrameType::Event,
            Frame::Comment { .. } => FrameType::Comment,
            Frame::Retry { .. } => FrameType::Retry,
        }
    }

    /// Create a new Event frame without an id.
    #[must_use]
    pub fn event(event: impl Into<String>, data: impl Into<String>) -> Self {
        Frame::Event {
            id: None,
            event: event.into(),
            data: data.into(),
        }
    }

    /// Attach an id to an Event frame. Other frames are returned unchanged.
    #[must_use]
    pub fn with_id(self, new_id: u64) -> Self {
        match self {
            Frame::Event { event, data, .. } => Frame::Event {
                id: Some(new_id),
                event,
                data,
            },
            other => other,
        }
    }

    /// Create a new Comment frame.
    #[must_use]
    pub fn comment(text: impl Into<String>) -> Self {
        Frame::Comment { text: text.into() }
    }

    /// Create the heartbeat comment frame.
    #[must_use]
    pub fn keep_alive() -> Self {
        Frame::comment(KEEP_ALIVE)
    }

    /// Create a new Retry frame.
    #[must_use]
    pub fn retry(millis: u64) -> Self {
        Frame::Retry { millis }
    }

    /// Check whether this frame is the heartbeat comment.
    #[must_use]
    pub fn is_keep_alive(&self) -> bool {
        matches!(self, Frame::Comment { text } if text == KEEP_ALIVE)
    }
}
