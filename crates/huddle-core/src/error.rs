//! Error types shared across the hub.

use thiserror::Error;

use crate::event::EventKind;

/// Malformed input rejected before it reaches the registry or a queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Invalid team identifier.
    #[error("Invalid team id: {0}")]
    InvalidTeam(&'static str),

    /// Unknown event kind name.
    #[error("Unknown event kind: {0}")]
    UnknownKind(String),

    /// Payload does not match the schema of its event kind.
    #[error("Invalid {kind} payload: {reason}")]
    Payload {
        /// Kind the payload was checked against.
        kind: EventKind,
        /// Why it was rejected.
        reason: String,
    },

    /// Invalid meeting field.
    #[error("Invalid meeting: {0}")]
    Meeting(String),
}

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// Request rejected by validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The team already has the maximum number of subscribers.
    #[error("Team {team} has reached the subscriber limit of {limit}")]
    TeamFull {
        /// Team that is full.
        team: String,
        /// Configured limit.
        limit: usize,
    },

    /// The hub is shutting down and accepts no new subscribers.
    #[error("Hub is shutting down")]
    ShuttingDown,
}
