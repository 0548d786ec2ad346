//! External collaborators: the meeting store and the notification sink.
//!
//! The hub never owns meetings or notification history. It talks to them
//! through these traits; the in-memory implementations back the server and
//! the tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

use crate::error::ValidationError;
use crate::meeting::{Meeting, MeetingPatch};

/// Number of recent sends [`MemoryNotificationSink`] keeps by default.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

/// Meeting store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Meeting not found.
    #[error("Meeting not found: {0}")]
    NotFound(String),

    /// The backing store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// An update would leave the meeting invalid.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Notification sink errors.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Sending failed.
    #[error("Failed to notify {recipient}: {reason}")]
    SendFailed {
        /// Intended recipient.
        recipient: String,
        /// Transport-specific reason.
        reason: String,
    },

    /// The notification log could not be read or written.
    #[error("Notification log unavailable: {0}")]
    Unavailable(String),
}

/// Notification kinds tracked for deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Invite,
    Reminder,
}

impl NotificationKind {
    /// Get a static label.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Invite => "invite",
            NotificationKind::Reminder => "reminder",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dedup key: at most one notification per meeting, kind and recipient.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NotificationKey {
    pub meeting_id: String,
    pub kind: NotificationKind,
    pub recipient: String,
}

impl NotificationKey {
    /// Create a new key.
    #[must_use]
    pub fn new(
        meeting_id: impl Into<String>,
        kind: NotificationKind,
        recipient: impl Into<String>,
    ) -> Self {
        Self {
            meeting_id: meeting_id.into(),
            kind,
            recipient: recipient.into(),
        }
    }
}

/// Meeting persistence.
#[async_trait]
pub trait MeetingStore: Send + Sync {
    /// Meetings of a team, ordered by start.
    async fn list_meetings(&self, team_id: &str) -> Result<Vec<Meeting>, StoreError>;

    /// Look up a meeting.
    async fn get_meeting(&self, id: &str) -> Result<Option<Meeting>, StoreError>;

    /// Insert or replace a meeting.
    async fn upsert_meeting(&self, meeting: Meeting) -> Result<(), StoreError>;

    /// Merge a patch into the stored meeting and return the result.
    ///
    /// The merge is atomic with respect to [`MeetingStore::mark_reminded`]:
    /// fields the patch does not name, the reminder state included, keep
    /// their stored values.
    async fn update_meeting(
        &self,
        id: &str,
        patch: MeetingPatch,
        now: DateTime<Utc>,
    ) -> Result<Meeting, StoreError>;

    /// Delete a meeting, returning it if it existed.
    async fn delete_meeting(&self, id: &str) -> Result<Option<Meeting>, StoreError>;

    /// Meetings starting within `[now, now + lookahead]` whose reminder has
    /// not been completed, ordered by start.
    async fn due_reminders(
        &self,
        now: DateTime<Utc>,
        lookahead: Duration,
    ) -> Result<Vec<Meeting>, StoreError>;

    /// Mark a meeting's reminder as completed.
    async fn mark_reminded(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
}

/// Outbound notifications (email) and their dedup log.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver a notification.
    async fn send_notification(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError>;

    /// Record that a notification was sent. Recording twice is a no-op.
    async fn record_notification(&self, key: &NotificationKey) -> Result<(), NotifyError>;

    /// Check whether a notification was already recorded.
    async fn is_notified(&self, key: &NotificationKey) -> Result<bool, NotifyError>;
}

/// In-memory meeting store.
#[derive(Debug, Default)]
pub struct MemoryMeetingStore {
    meetings: DashMap<String, Meeting>,
}

impl MemoryMeetingStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored meetings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.meetings.len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.meetings.is_empty()
    }
}

fn sorted_by_start(mut meetings: Vec<Meeting>) -> Vec<Meeting> {
    meetings.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
    meetings
}

#[async_trait]
impl MeetingStore for MemoryMeetingStore {
    async fn list_meetings(&self, team_id: &str) -> Result<Vec<Meeting>, StoreError> {
        let meetings = self
            .meetings
            .iter()
            .filter(|m| m.team_id == team_id)
            .map(|m| m.value().clone())
            .collect();
        Ok(sorted_by_start(meetings))
    }

    async fn get_meeting(&self, id: &str) -> Result<Option<Meeting>, StoreError> {
        Ok(self.meetings.get(id).map(|m| m.value().clone()))
    }

    async fn upsert_meeting(&self, meeting: Meeting) -> Result<(), StoreError> {
        debug!(meeting = %meeting.id, team = %meeting.team_id, "Upserting meeting");
        self.meetings.insert(meeting.id.clone(), meeting);
        Ok(())
    }

    async fn update_meeting(
        &self,
        id: &str,
        patch: MeetingPatch,
        now: DateTime<Utc>,
    ) -> Result<Meeting, StoreError> {
        let mut stored = self
            .meetings
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let updated = stored.patched(patch, now)?;
        *stored = updated.clone();
        debug!(meeting = %id, "Meeting updated");
        Ok(updated)
    }

    async fn delete_meeting(&self, id: &str) -> Result<Option<Meeting>, StoreError> {
        Ok(self.meetings.remove(id).map(|(_, meeting)| meeting))
    }

    async fn due_reminders(
        &self,
        now: DateTime<Utc>,
        lookahead: Duration,
    ) -> Result<Vec<Meeting>, StoreError> {
        let due = self
            .meetings
            .iter()
            .filter(|m| m.reminder_sent_at.is_none() && m.starts_within(now, lookahead))
            .map(|m| m.value().clone())
            .collect();
        Ok(sorted_by_start(due))
    }

    async fn mark_reminded(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut meeting = self
            .meetings
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        meeting.reminder_sent_at = Some(at);
        Ok(())
    }
}

/// A notification captured by [`MemoryNotificationSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// In-memory notification sink.
///
/// "Sends" by logging and appending to a bounded outbox that keeps only the
/// most recent sends. The dedup log is a set.
#[derive(Debug)]
pub struct MemoryNotificationSink {
    records: DashSet<NotificationKey>,
    outbox: Mutex<VecDeque<SentNotification>>,
    outbox_capacity: usize,
    total_sent: AtomicU64,
}

impl Default for MemoryNotificationSink {
    fn default() -> Self {
        Self::with_outbox_capacity(DEFAULT_OUTBOX_CAPACITY)
    }
}

impl MemoryNotificationSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty sink that keeps the last `capacity` sends.
    #[must_use]
    pub fn with_outbox_capacity(capacity: usize) -> Self {
        Self {
            records: DashSet::new(),
            outbox: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_OUTBOX_CAPACITY))),
            outbox_capacity: capacity,
            total_sent: AtomicU64::new(0),
        }
    }

    /// The most recent sends, oldest first.
    #[must_use]
    pub fn sent(&self) -> Vec<SentNotification> {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Number of notifications sent since the sink was created.
    #[must_use]
    pub fn sent_count(&self) -> u64 {
        self.total_sent.load(Ordering::Relaxed)
    }

    /// Number of dedup records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn send_notification(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        info!(recipient = %recipient, subject = %subject, "Sending notification");
        self.total_sent.fetch_add(1, Ordering::Relaxed);
        if self.outbox_capacity == 0 {
            return Ok(());
        }

        let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        if outbox.len() >= self.outbox_capacity {
            outbox.pop_front();
        }
        outbox.push_back(SentNotification {
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }

    async fn record_notification(&self, key: &NotificationKey) -> Result<(), NotifyError> {
        self.records.insert(key.clone());
        Ok(())
    }

    async fn is_notified(&self, key: &NotificationKey) -> Result<bool, NotifyError> {
        Ok(self.records.contains(key))
    }
}
