//! Shared fixtures for the Huddle benchmarks.

use chrono::{Duration, Utc};
use huddle_core::{EventPayload, Hub, HubConfig, Meeting, Subscription};

/// A meeting with `participants` invitees.
#[must_use]
pub fn meeting(id: &str, team: &str, participants: usize) -> Meeting {
    let now = Utc::now();
    Meeting {
        id: id.to_string(),
        team_id: team.to_string(),
        title: "Weekly planning".to_string(),
        description: Some("Agenda: roadmap, hiring, incidents".to_string()),
        start: now + Duration::minutes(5),
        end: now + Duration::minutes(35),
        organizer_id: "user-1".to_string(),
        participant_emails: (0..participants)
            .map(|i| format!("member{i}@example.com"))
            .collect(),
        created_at: now,
        updated_at: now,
        reminder_sent_at: None,
    }
}

/// A typical `meeting.created` payload.
#[must_use]
pub fn created_payload() -> EventPayload {
    EventPayload::MeetingCreated(meeting("m-bench", "team-bench", 8))
}

/// A hub with `subscribers` open subscriptions on `team`.
///
/// # Panics
///
/// Panics if the hub rejects a subscription.
#[must_use]
pub fn hub_with_subscribers(team: &str, subscribers: usize) -> (Hub, Vec<Subscription>) {
    let hub = Hub::with_config(HubConfig {
        max_subscribers_per_team: subscribers.max(1),
        ..HubConfig::default()
    });
    let subscriptions = (0..subscribers)
        .map(|_| hub.subscribe(team).expect("subscribe"))
        .collect();
    (hub, subscriptions)
}

/// Drain every subscription's queue.
pub fn drain(subscriptions: &[Subscription]) -> usize {
    subscriptions
        .iter()
        .map(|s| std::iter::from_fn(|| s.subscriber().queue().try_recv()).count())
        .sum()
}
