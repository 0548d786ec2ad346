//! Event types fanned out by the hub.
//!
//! Every event belongs to one team and carries one of a closed set of
//! payloads. The payload determines the event kind; there is no way to
//! build an event whose kind and payload disagree.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use huddle_protocol::{codec, Frame};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ValidationError;
use crate::meeting::Meeting;

/// A unique event identifier, increasing in emission order.
pub type EventId = u64;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// Generate the next event id.
#[must_use]
pub fn next_event_id() -> EventId {
    NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// The closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MeetingCreated,
    MeetingUpdated,
    MeetingDeleted,
    MeetingReminder,
}

impl EventKind {
    /// All kinds, in declaration order.
    pub const ALL: [EventKind; 4] = [
        EventKind::MeetingCreated,
        EventKind::MeetingUpdated,
        EventKind::MeetingDeleted,
        EventKind::MeetingReminder,
    ];

    /// Wire name of the kind, used as the SSE `event:` field.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MeetingCreated => "meeting.created",
            EventKind::MeetingUpdated => "meeting.updated",
            EventKind::MeetingDeleted => "meeting.deleted",
            EventKind::MeetingReminder => "meeting.reminder",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownKind(s.to_string()))
    }
}

/// Event payload, one variant per kind.
///
/// Created and updated events carry the full meeting. Deleted events carry
/// `{"id": ...}` and reminder events carry `{"meetingId": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    MeetingCreated(Meeting),
    MeetingUpdated(Meeting),
    MeetingDeleted {
        id: String,
    },
    MeetingReminder {
        #[serde(rename = "meetingId")]
        meeting_id: String,
    },
}

#[derive(Deserialize)]
struct DeletedBody {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReminderBody {
    meeting_id: String,
}

impl EventPayload {
    /// Get the event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::MeetingCreated(_) => EventKind::MeetingCreated,
            EventPayload::MeetingUpdated(_) => EventKind::MeetingUpdated,
            EventPayload::MeetingDeleted { .. } => EventKind::MeetingDeleted,
            EventPayload::MeetingReminder { .. } => EventKind::MeetingReminder,
        }
    }

    /// Id of the meeting the event is about.
    #[must_use]
    pub fn meeting_id(&self) -> &str {
        match self {
            EventPayload::MeetingCreated(m) | EventPayload::MeetingUpdated(m) => &m.id,
            EventPayload::MeetingDeleted { id } => id,
            EventPayload::MeetingReminder { meeting_id } => meeting_id,
        }
    }

    /// Build a payload from its kind and a loose JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value does not match the kind's schema.
    pub fn from_json(kind: EventKind, value: serde_json::Value) -> Result<Self, ValidationError> {
        let parsed = match kind {
            EventKind::MeetingCreated => serde_json::from_value(value).map(Self::MeetingCreated),
            EventKind::MeetingUpdated => serde_json::from_value(value).map(Self::MeetingUpdated),
            EventKind::MeetingDeleted => serde_json::from_value::<DeletedBody>(value)
                .map(|body| Self::MeetingDeleted { id: body.id }),
            EventKind::MeetingReminder => serde_json::from_value::<ReminderBody>(value)
                .map(|body| Self::MeetingReminder {
                    meeting_id: body.meeting_id,
                }),
        };

        parsed.map_err(|e| ValidationError::Payload {
            kind,
            reason: e.to_string(),
        })
    }
}

/// An event addressed to one team.
///
/// The stream frame is encoded once at construction and shared by every
/// subscriber queue the event lands in.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unique event identifier.
    pub id: EventId,
    /// Target team.
    pub team_id: String,
    /// Typed payload.
    pub payload: EventPayload,
    /// When the event was emitted.
    pub emitted_at: DateTime<Utc>,
    wire: Bytes,
}

impl Event {
    /// Create a new event and encode its stream frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized or framed.
    pub fn new(team_id: impl Into<String>, payload: EventPayload) -> Result<Self, ValidationError> {
        let id = next_event_id();
        let kind = payload.kind();

        let data = serde_json::to_string(&payload).map_err(|e| ValidationError::Payload {
            kind,
            reason: e.to_string(),
        })?;
        let wire = codec::encode(&Frame::event(kind.as_str(), data).with_id(id)).map_err(|e| {
            ValidationError::Payload {
                kind,
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            id,
            team_id: team_id.into(),
            payload,
            emitted_at: Utc::now(),
            wire,
        })
    }

    /// Get the event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Get the encoded stream frame.
    #[must_use]
    pub fn wire(&self) -> &Bytes {
        &self.wire
    }

    /// Get the payload as a JSON value.
    #[must_use]
    pub fn payload_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}
