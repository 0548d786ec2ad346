//! Codec for encoding and decoding Huddle stream frames.
//!
//! Frames are written as server-sent event blocks: one `field: value` line
//! per field, terminated by an empty line. Only LF line endings are
//! produced; the decoder tolerates a trailing CR on each line.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Maximum encoded frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Event name assumed by clients when a block carries no `event:` field.
pub const DEFAULT_EVENT_NAME: &str = "message";

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode a frame.
    #[error("Incomplete frame")]
    Incomplete,

    /// Frame bytes are not valid UTF-8.
    #[error("Invalid UTF-8 in frame: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a frame to bytes.
///
/// # Errors
///
/// Returns an error if the frame is too large or has an invalid event name.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(64);
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// On error the buffer is left as it was.
///
/// # Errors
///
/// Returns an error if the frame is too large or has an invalid event name.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let start = buf.len();

    match frame {
        Frame::Event { id, event, data } => {
            validate_event_name(event)?;
            if let Some(id) = id {
                put_field(buf, "id", &id.to_string());
            }
            put_field(buf, "event", event);
            for line in data.split('\n') {
                put_field(buf, "data", line.strip_suffix('\r').unwrap_or(line));
            }
        }
        Frame::Comment { text } => {
            for line in text.split('\n') {
                put_field(buf, "", line.strip_suffix('\r').unwrap_or(line));
            }
        }
        Frame::Retry { millis } => put_field(buf, "retry", &millis.to_string()),
    }
    buf.put_u8(b'\n');

    let size = buf.len() - start;
    if size > MAX_FRAME_SIZE {
        buf.truncate(start);
        return Err(ProtocolError::FrameTooLarge(size));
    }

    Ok(())
}

/// Decode a single frame from bytes.
///
/// # Errors
///
/// Returns an error if the data does not hold a complete, valid frame.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    let mut buf = BytesMut::from(data);
    decode_from(&mut buf)?.ok_or(ProtocolError::Incomplete)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
/// Blocks that carry no recognised field are consumed and skipped.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    loop {
        let Some(end) = find_boundary(buf) else {
            if buf.len() > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(buf.len()));
            }
            return Ok(None);
        };

        let block = buf.split_to(end + 2);
        let text = std::str::from_utf8(&block[..end])?;

        if let Some(frame) = parse_block(text)? {
            return Ok(Some(frame));
        }
    }
}

fn put_field(buf: &mut BytesMut, name: &str, value: &str) {
    buf.reserve(name.len() + value.len() + 3);
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_u8(b'\n');
}

fn validate_event_name(name: &str) -> Result<(), ProtocolError> {
    if name.is_empty() {
        return Err(ProtocolError::Invalid("event name cannot be empty".into()));
    }
    if name.contains(['\n', '\r']) {
        return Err(ProtocolError::Invalid(format!(
            "event name contains a line break: {name:?}"
        )));
    }
    Ok(())
}

fn find_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn parse_block(text: &str) -> Result<Option<Frame>, ProtocolError> {
    let mut id = None;
    let mut event: Option<String> = None;
    let mut data: Option<String> = None;
    let mut retry = None;
    let mut comments = Vec::new();

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix(':') {
            comments.push(rest.strip_prefix(' ').unwrap_or(rest));
            continue;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "id" => id = Some(parse_number("id", value)?),
            "event" => event = Some(value.to_string()),
            "data" => match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            "retry" => retry = Some(parse_number("retry", value)?),
            // Unknown fields are ignored, as browsers do.
            _ => {}
        }
    }

    if event.is_some() || data.is_some() {
        return Ok(Some(Frame::Event {
            id,
            event: event.unwrap_or_else(|| DEFAULT_EVENT_NAME.to_string()),
            data: data.unwrap_or_default(),
        }));
    }

    if let Some(millis) = retry {
        return Ok(Some(Frame::Retry { millis }));
    }

    if !comments.is_empty() {
        return Ok(Some(Frame::Comment {
            text: comments.join("\n"),
        }));
    }

    Ok(None)
}

fn parse_number(field: &str, value: &str) -> Result<u64, ProtocolError> {
    value
        .parse()
        .map_err(|_| ProtocolError::Invalid(format!("invalid {field} value: {value:?}")))
}
