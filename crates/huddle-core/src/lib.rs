//! # huddle-core
//!
//! Core types and event routing for the Huddle team notification hub.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Event** - Tagged meeting events fanned out to a team
//! - **Registry** - Per-team subscriber bookkeeping
//! - **Queue** - Bounded per-subscriber outbound queue (drop-oldest)
//! - **Hub** - Team-scoped broadcast over the registry
//! - **Reminder** - Sweeps due meetings and emits reminder events
//! - **Store** - Meeting store and notification sink interfaces
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Mutation   │────▶│     Hub     │────▶│  Registry   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            ▲                   │
//! ┌─────────────┐            │                   ▼
//! │  Reminder   │────────────┘            ┌─────────────┐
//! │  Scanner    │                         │ Subscriber  │──▶ session writer
//! └─────────────┘                         │   queues    │
//!                                         └─────────────┘
//! ```

pub mod error;
pub mod event;
pub mod hub;
pub mod meeting;
pub mod queue;
pub mod registry;
pub mod reminder;
pub mod store;

pub use error::{HubError, ValidationError};
pub use event::{Event, EventId, EventKind, EventPayload};
pub use hub::{BroadcastReport, Hub, HubConfig, OverflowPolicy, Subscription};
pub use meeting::{Meeting, MeetingPatch, NewMeeting};
pub use queue::{OutboundQueue, PushOutcome};
pub use registry::{
    CloseReason, ConnectionState, Registry, RegistryStats, Subscriber, SubscriberHandle,
    SubscriberId,
};
pub use reminder::{ReminderScanner, SweepError, SweepOutcome, SweepReport};
pub use store::{
    MeetingStore, MemoryMeetingStore, MemoryNotificationSink, NotificationKey, NotificationKind,
    NotificationSink, NotifyError, SentNotification, StoreError,
};
