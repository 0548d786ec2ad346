//! Meeting model.
//!
//! Meetings are owned by the meeting store; the hub only carries them
//! inside `meeting.created` and `meeting.updated` events.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Maximum meeting title length.
pub const MAX_TITLE_LENGTH: usize = 200;

/// A scheduled team meeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meeting {
    /// Meeting identifier.
    pub id: String,
    /// Owning team.
    pub team_id: String,
    /// Title shown in invitations and reminders.
    pub title: String,
    /// Optional free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Scheduled start.
    pub start: DateTime<Utc>,
    /// Scheduled end.
    pub end: DateTime<Utc>,
    /// User who created the meeting.
    pub organizer_id: String,
    /// Participants notified about the meeting.
    #[serde(default)]
    pub participant_emails: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// When the reminder sweep completed for this meeting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reminder_sent_at: Option<DateTime<Utc>>,
}

/// Fields supplied when creating a meeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMeeting {
    pub team_id: String,
    pub title: String,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub organizer_id: String,
    pub participant_emails: Vec<String>,
}

/// Partial update of a meeting. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub participant_emails: Option<Vec<String>>,
}

impl Meeting {
    /// Create a meeting with a fresh id.
    ///
    /// # Errors
    ///
    /// Returns an error if the title, time range or participant list is invalid.
    pub fn create(new: NewMeeting, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        let meeting = Self {
            id: uuid::Uuid::new_v4().to_string(),
            team_id: new.team_id,
            title: new.title,
            description: new.description,
            start: new.start,
            end: new.end,
            organizer_id: new.organizer_id,
            participant_emails: new.participant_emails,
            created_at: now,
            updated_at: now,
            reminder_sent_at: None,
        };
        meeting.validate()?;
        Ok(meeting)
    }

    /// Return a copy with the patch applied and `updated_at` bumped.
    ///
    /// # Errors
    ///
    /// Returns an error if the merged meeting is invalid.
    pub fn patched(&self, patch: MeetingPatch, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        let mut updated = self.clone();
        if let Some(title) = patch.title {
            updated.title = title;
        }
        if let Some(description) = patch.description {
            updated.description = Some(description);
        }
        if let Some(start) = patch.start {
            updated.start = start;
        }
        if let Some(end) = patch.end {
            updated.end = end;
        }
        if let Some(emails) = patch.participant_emails {
            updated.participant_emails = emails;
        }
        updated.updated_at = now;
        updated.validate()?;
        Ok(updated)
    }

    /// Check the meeting's fields.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(ValidationError::Meeting("title cannot be empty".into()));
        }
        if title.len() > MAX_TITLE_LENGTH {
            return Err(ValidationError::Meeting("title too long".into()));
        }
        if self.end < self.start {
            return Err(ValidationError::Meeting("end is before start".into()));
        }
        if let Some(bad) = self.participant_emails.iter().find(|e| !is_plausible_email(e)) {
            return Err(ValidationError::Meeting(format!("invalid participant email: {bad}")));
        }
        Ok(())
    }

    /// Whether the meeting starts within `[now, now + lookahead]`.
    #[must_use]
    pub fn starts_within(&self, now: DateTime<Utc>, lookahead: Duration) -> bool {
        self.start >= now && self.start <= now + lookahead
    }
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.contains(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_meeting(start: DateTime<Utc>) -> NewMeeting {
        NewMeeting {
            team_id: "team-a".into(),
            title: "Standup".into(),
            description: None,
            start,
            end: start + Duration::minutes(15),
            organizer_id: "user-1".into(),
            participant_emails: vec!["ana@example.com".into()],
        }
    }

    #[test]
    fn test_create_assigns_id_and_timestamps() {
        let now = Utc::now();
        let meeting = Meeting::create(new_meeting(now), now).unwrap();
        assert!(!meeting.id.is_empty());
        assert_eq!(meeting.created_at, now);
        assert_eq!(meeting.updated_at, now);
        assert!(meeting.reminder_sent_at.is_none());
    }

    #[test]
    fn test_validation() {
        let now = Utc::now();

        let mut blank = new_meeting(now);
        blank.title = "   ".into();
        assert!(Meeting::create(blank, now).is_err());

        let mut backwards = new_meeting(now);
        backwards.end = now - Duration::minutes(1);
        assert!(Meeting::create(backwards, now).is_err());

        let mut bad_email = new_meeting(now);
        bad_email.participant_emails = vec!["not-an-email".into()];
        assert!(Meeting::create(bad_email, now).is_err());
    }

    #[test]
    fn test_patch_merges_fields() {
        let now = Utc::now();
        let meeting = Meeting::create(new_meeting(now), now).unwrap();

        let later = now + Duration::seconds(5);
        let patch = MeetingPatch {
            title: Some("Retro".into()),
            ..MeetingPatch::default()
        };
        let updated = meeting.patched(patch, later).unwrap();

        assert_eq!(updated.id, meeting.id);
        assert_eq!(updated.title, "Retro");
        assert_eq!(updated.start, meeting.start);
        assert_eq!(updated.updated_at, later);

        let invalid = MeetingPatch {
            end: Some(now - Duration::hours(1)),
            ..MeetingPatch::default()
        };
        assert!(meeting.patched(invalid, later).is_err());
    }

    #[test]
    fn test_starts_within() {
        let now = Utc::now();
        let meeting = Meeting::create(new_meeting(now + Duration::minutes(5)), now).unwrap();

        assert!(meeting.starts_within(now, Duration::minutes(10)));
        assert!(!meeting.starts_within(now, Duration::minutes(4)));
        assert!(!meeting.starts_within(now + Duration::minutes(6), Duration::minutes(10)));
    }

    #[test]
    fn test_serializes_camel_case() {
        let now = Utc::now();
        let meeting = Meeting::create(new_meeting(now), now).unwrap();
        let json = serde_json::to_value(&meeting).unwrap();

        assert_eq!(json["teamId"], "team-a");
        assert!(json["participantEmails"].is_array());
        assert!(json.get("description").is_none());
        assert!(json.get("reminderSentAt").is_none());
    }
}
