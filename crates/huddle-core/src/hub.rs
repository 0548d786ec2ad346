//! Team broadcast hub.
//!
//! The hub is constructed explicitly and shared by reference with request
//! handlers and the reminder scanner. Broadcasting only enqueues; network
//! writes happen in each subscriber's own session task.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::error::HubError;
use crate::event::{Event, EventId, EventKind, EventPayload};
use crate::queue::PushOutcome;
use crate::registry::{
    validate_team_id, CloseReason, Registry, RegistryStats, Subscriber, SubscriberHandle,
    SubscriberId,
};

/// What to do when a subscriber's queue overflows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the oldest pending event and keep the subscriber.
    #[default]
    DropOldest,
    /// Drop the oldest pending event; close the subscriber once it has
    /// overflowed `after` times without its writer draining anything.
    Disconnect {
        /// Consecutive overflows tolerated.
        after: u32,
    },
}

/// Hub configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Per-subscriber outbound queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Maximum subscribers per team.
    #[serde(default = "default_max_subscribers_per_team")]
    pub max_subscribers_per_team: usize,
    /// Overflow handling.
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
}

fn default_queue_capacity() -> usize {
    64
}

fn default_max_subscribers_per_team() -> usize {
    1024
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_subscribers_per_team: default_max_subscribers_per_team(),
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Id of the emitted event.
    pub event_id: EventId,
    /// Kind of the emitted event.
    pub kind: EventKind,
    /// Subscribers the event was queued for.
    pub delivered: usize,
    /// Subscribers that lost an older event to make room.
    pub dropped: usize,
    /// Subscribers closed by the overflow policy.
    pub evicted: usize,
    /// Subscribers already closed, skipped.
    pub skipped: usize,
}

/// A registered subscription.
///
/// Owned by the streaming session. Closing or dropping it unregisters the
/// subscriber exactly once.
#[derive(Debug)]
pub struct Subscription {
    subscriber: Arc<Subscriber>,
    handle: SubscriberHandle,
    registry: Arc<Registry>,
    released: AtomicBool,
}

impl Subscription {
    /// Get the subscriber.
    #[must_use]
    pub fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }

    /// Get the registry handle.
    #[must_use]
    pub fn handle(&self) -> &SubscriberHandle {
        &self.handle
    }

    /// Get the subscriber id.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.handle.id()
    }

    /// Close the subscriber and unregister it.
    ///
    /// Returns `true` if this call closed the subscriber; `false` if it was
    /// already closed (by the hub, or a racing trigger).
    pub fn close(&self, reason: CloseReason) -> bool {
        let closed_now = self.subscriber.close(reason);
        self.release();
        closed_now
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.registry.unregister(&self.handle);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscriber.close(CloseReason::Disconnected);
        self.release();
    }
}

/// The team broadcast hub.
#[derive(Debug)]
pub struct Hub {
    registry: Arc<Registry>,
    config: HubConfig,
    shutting_down: AtomicBool,
}

impl Hub {
    /// Create a hub with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a hub with custom configuration and an empty registry.
    #[must_use]
    pub fn with_config(config: HubConfig) -> Self {
        info!("Creating hub with config: {:?}", config);
        Self {
            registry: Arc::new(Registry::new(config.max_subscribers_per_team)),
            config,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Get the hub configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Get the subscriber registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Create and register a subscriber for a team.
    ///
    /// # Errors
    ///
    /// Returns an error if the team id is invalid, the team is full or the
    /// hub is shutting down.
    pub fn subscribe(&self, team_id: &str) -> Result<Subscription, HubError> {
        if self.is_shutting_down() {
            return Err(HubError::ShuttingDown);
        }

        let subscriber = Arc::new(Subscriber::new(team_id, self.config.queue_capacity));
        let handle = self.registry.register(Arc::clone(&subscriber))?;

        // A shutdown that raced the registration may have missed us.
        if self.is_shutting_down() {
            subscriber.close(CloseReason::Shutdown);
            self.registry.unregister(&handle);
            return Err(HubError::ShuttingDown);
        }

        Ok(Subscription {
            subscriber,
            handle,
            registry: Arc::clone(&self.registry),
            released: AtomicBool::new(false),
        })
    }

    /// Broadcast an event to every current subscriber of a team.
    ///
    /// Never waits on a subscriber. Closed subscribers are skipped, and a
    /// subscriber's overflow never affects the others.
    ///
    /// # Errors
    ///
    /// Returns an error only if the team id or payload is invalid.
    pub fn broadcast(
        &self,
        team_id: &str,
        payload: EventPayload,
    ) -> Result<BroadcastReport, HubError> {
        validate_team_id(team_id)?;
        let event = Arc::new(Event::new(team_id, payload)?);

        let mut report = BroadcastReport {
            event_id: event.id,
            kind: event.kind(),
            delivered: 0,
            dropped: 0,
            evicted: 0,
            skipped: 0,
        };

        for subscriber in self.registry.snapshot(team_id) {
            match subscriber.enqueue(Arc::clone(&event)) {
                PushOutcome::Enqueued => report.delivered += 1,
                PushOutcome::DroppedOldest { streak } => match self.config.overflow_policy {
                    OverflowPolicy::Disconnect { after } if streak >= after => {
                        warn!(
                            team = %team_id,
                            subscriber = subscriber.id(),
                            streak,
                            "Evicting subscriber after repeated overflow"
                        );
                        subscriber.close(CloseReason::Overflow);
                        report.evicted += 1;
                    }
                    _ => {
                        trace!(
                            team = %team_id,
                            subscriber = subscriber.id(),
                            streak,
                            "Queue full, dropped oldest event"
                        );
                        report.delivered += 1;
                        report.dropped += 1;
                    }
                },
                PushOutcome::Closed => report.skipped += 1,
            }
        }

        debug!(
            team = %team_id,
            kind = %report.kind,
            event = report.event_id,
            delivered = report.delivered,
            dropped = report.dropped,
            "Broadcast"
        );
        Ok(report)
    }

    /// Check if the hub is shutting down.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Stop accepting subscribers and close every open connection.
    ///
    /// Returns the number of subscribers closed.
    pub fn shutdown(&self) -> usize {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let closed = self.registry.close_all(CloseReason::Shutdown);
        info!(closed, "Hub shut down");
        closed
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
