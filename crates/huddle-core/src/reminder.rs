//! Reminder scanner.
//!
//! A sweep finds meetings starting soon, emails each participant once, and
//! broadcasts a single `meeting.reminder` event per meeting. Sweeps are
//! serialized; a trigger that arrives while one is running is skipped.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::HubError;
use crate::event::EventPayload;
use crate::hub::Hub;
use crate::meeting::Meeting;
use crate::store::{
    MeetingStore, NotificationKey, NotificationKind, NotificationSink, NotifyError, StoreError,
};

/// Failure while reminding one meeting. The meeting is retried next sweep.
#[derive(Debug, Error)]
pub enum SweepError {
    /// The meeting store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Sending or recording a notification failed.
    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    /// The dedup log could not be checked; the send was skipped.
    #[error("Dedup check failed for {recipient}: {source}")]
    DedupCheck {
        /// Recipient whose send was skipped.
        recipient: String,
        /// Underlying failure.
        #[source]
        source: NotifyError,
    },

    /// The reminder event was rejected by the hub.
    #[error("Broadcast error: {0}")]
    Broadcast(#[from] HubError),
}

/// Counters for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Meetings returned by the due query.
    pub due: usize,
    /// Meetings fully reminded and broadcast.
    pub reminded: usize,
    /// Notifications sent.
    pub notifications_sent: usize,
    /// Participants skipped because they were already notified.
    pub duplicates_skipped: usize,
    /// Meetings that failed and will be retried.
    pub failed: usize,
}

/// Result of triggering a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    /// The sweep ran.
    Completed(SweepReport),
    /// Another sweep was in progress; this trigger was ignored.
    Skipped,
}

/// Discovers due reminders and drives notifications and broadcasts.
pub struct ReminderScanner {
    hub: Arc<Hub>,
    store: Arc<dyn MeetingStore>,
    sink: Arc<dyn NotificationSink>,
    lookahead: Duration,
    sweep_lock: Mutex<()>,
}

impl ReminderScanner {
    /// Create a scanner.
    #[must_use]
    pub fn new(
        hub: Arc<Hub>,
        store: Arc<dyn MeetingStore>,
        sink: Arc<dyn NotificationSink>,
        lookahead: Duration,
    ) -> Self {
        Self {
            hub,
            store,
            sink,
            lookahead,
            sweep_lock: Mutex::new(()),
        }
    }

    /// Reminder lookahead window.
    #[must_use]
    pub fn lookahead(&self) -> Duration {
        self.lookahead
    }

    /// Run one sweep at `now`, unless one is already running.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepOutcome {
        let Ok(_guard) = self.sweep_lock.try_lock() else {
            debug!("Reminder sweep already in progress, skipping trigger");
            return SweepOutcome::Skipped;
        };

        let mut report = SweepReport::default();

        let due = match self.store.due_reminders(now, self.lookahead).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Failed to query due reminders");
                return SweepOutcome::Completed(report);
            }
        };
        report.due = due.len();

        for meeting in &due {
            match self.remind(meeting, now, &mut report).await {
                Ok(()) => report.reminded += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        meeting = %meeting.id,
                        team = %meeting.team_id,
                        error = %e,
                        "Reminder failed, will retry on next sweep"
                    );
                }
            }
        }

        if report.due > 0 {
            info!(
                due = report.due,
                reminded = report.reminded,
                sent = report.notifications_sent,
                failed = report.failed,
                "Reminder sweep finished"
            );
        }
        SweepOutcome::Completed(report)
    }

    async fn remind(
        &self,
        meeting: &Meeting,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), SweepError> {
        let subject = format!("Reminder: {}", meeting.title);
        let body = format!("Starting at {}.", meeting.start.format("%Y-%m-%d %H:%M UTC"));
        let mut deferred = None;

        for recipient in &meeting.participant_emails {
            let key = NotificationKey::new(&meeting.id, NotificationKind::Reminder, recipient);

            match self.sink.is_notified(&key).await {
                Ok(true) => {
                    report.duplicates_skipped += 1;
                    continue;
                }
                Ok(false) => {}
                Err(source) => {
                    // Unknown dedup state: never risk a second send.
                    warn!(
                        meeting = %meeting.id,
                        recipient = %recipient,
                        error = %source,
                        "Dedup check failed, skipping send"
                    );
                    deferred.get_or_insert(SweepError::DedupCheck {
                        recipient: recipient.clone(),
                        source,
                    });
                    continue;
                }
            }

            self.sink.send_notification(recipient, &subject, &body).await?;
            report.notifications_sent += 1;
            self.sink.record_notification(&key).await?;
        }

        if let Some(e) = deferred {
            return Err(e);
        }

        self.store.mark_reminded(&meeting.id, now).await?;
        self.hub.broadcast(
            &meeting.team_id,
            EventPayload::MeetingReminder {
                meeting_id: meeting.id.clone(),
            },
        )?;
        Ok(())
    }

    /// Run sweeps every `period` until `shutdown` flips to `true` or its
    /// sender is dropped. `on_sweep` sees the outcome of every tick.
    pub fn spawn<F>(
        self: Arc<Self>,
        period: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
        on_sweep: F,
    ) -> JoinHandle<()>
    where
        F: Fn(&SweepOutcome) + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(period_ms = period.as_millis() as u64, "Reminder scanner started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let outcome = self.sweep(Utc::now()).await;
                        on_sweep(&outcome);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Reminder scanner stopped");
        })
    }
}
