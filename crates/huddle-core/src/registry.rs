//! Subscriber registry.
//!
//! Tracks live subscriber connections per team. The registry only holds
//! shared references; each subscriber is owned by its streaming session.

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{HubError, ValidationError};
use crate::event::Event;
use crate::queue::{OutboundQueue, PushOutcome};

/// Maximum team id length.
pub const MAX_TEAM_ID_LENGTH: usize = 256;

/// A subscriber identifier, increasing in registration order.
pub type SubscriberId = u64;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Validate a team id.
///
/// # Errors
///
/// Returns an error if the team id is empty, too long, reserved or not
/// printable ASCII.
pub fn validate_team_id(team_id: &str) -> Result<(), ValidationError> {
    if team_id.is_empty() {
        return Err(ValidationError::InvalidTeam("team id cannot be empty"));
    }
    if team_id.len() > MAX_TEAM_ID_LENGTH {
        return Err(ValidationError::InvalidTeam("team id too long"));
    }
    if team_id.starts_with('$') {
        return Err(ValidationError::InvalidTeam(
            "team ids starting with '$' are reserved",
        ));
    }
    if !team_id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err(ValidationError::InvalidTeam(
            "team id contains invalid characters",
        ));
    }
    Ok(())
}

/// Connection state of a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed(CloseReason),
}

/// Why a subscriber was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CloseReason {
    /// The client or server explicitly ended the subscription.
    Unsubscribed = 0,
    /// Writing to the client failed or timed out.
    WriteFailed = 1,
    /// The client went away.
    Disconnected = 2,
    /// Evicted after overflowing its queue repeatedly.
    Overflow = 3,
    /// The hub is shutting down.
    Shutdown = 4,
    /// The stream handshake could not be written.
    HandshakeFailed = 5,
}

impl CloseReason {
    const ALL: [CloseReason; 6] = [
        CloseReason::Unsubscribed,
        CloseReason::WriteFailed,
        CloseReason::Disconnected,
        CloseReason::Overflow,
        CloseReason::Shutdown,
        CloseReason::HandshakeFailed,
    ];

    /// Get a static label for logging and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Unsubscribed => "unsubscribed",
            CloseReason::WriteFailed => "write_failed",
            CloseReason::Disconnected => "disconnected",
            CloseReason::Overflow => "overflow",
            CloseReason::Shutdown => "shutdown",
            CloseReason::HandshakeFailed => "handshake_failed",
        }
    }

    /// Whether the close was requested rather than caused by an error.
    #[must_use]
    pub fn is_graceful(&self) -> bool {
        matches!(self, CloseReason::Unsubscribed | CloseReason::Shutdown)
    }
}

const STATE_CONNECTING: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSED_BASE: u8 = 2;

fn decode_state(raw: u8) -> ConnectionState {
    match raw {
        STATE_CONNECTING => ConnectionState::Connecting,
        STATE_OPEN => ConnectionState::Open,
        closed => ConnectionState::Closed(
            CloseReason::ALL
                .get(usize::from(closed - STATE_CLOSED_BASE))
                .copied()
                .unwrap_or(CloseReason::Disconnected),
        ),
    }
}

/// A subscriber connection: one streaming client of one team.
#[derive(Debug)]
pub struct Subscriber {
    id: SubscriberId,
    team_id: String,
    queue: OutboundQueue,
    state: AtomicU8,
    closed: Notify,
    created_at: DateTime<Utc>,
    last_active_ms: AtomicI64,
}

impl Subscriber {
    /// Create a subscriber in the `Connecting` state.
    #[must_use]
    pub fn new(team_id: impl Into<String>, queue_capacity: usize) -> Self {
        let now = Utc::now();
        Self {
            id: NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed),
            team_id: team_id.into(),
            queue: OutboundQueue::new(queue_capacity),
            state: AtomicU8::new(STATE_CONNECTING),
            closed: Notify::new(),
            created_at: now,
            last_active_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    /// Get the subscriber id.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Get the team this subscriber belongs to.
    #[must_use]
    pub fn team_id(&self) -> &str {
        &self.team_id
    }

    /// Get the outbound queue.
    #[must_use]
    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// When the subscriber was created.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the subscriber last had something written to it.
    #[must_use]
    pub fn last_active_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_active_ms.load(Ordering::Relaxed))
            .single()
            .unwrap_or(self.created_at)
    }

    /// Record activity on the connection.
    pub fn touch(&self) {
        self.last_active_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        decode_state(self.state.load(Ordering::Acquire))
    }

    /// Check if the subscriber is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_OPEN
    }

    /// Check if the subscriber is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) >= STATE_CLOSED_BASE
    }

    /// Get the close reason, if closed.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self.state() {
            ConnectionState::Closed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Move from `Connecting` to `Open`.
    ///
    /// Returns `false` if the subscriber was not connecting.
    pub fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_CONNECTING,
                STATE_OPEN,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Close the subscriber and release its queue.
    ///
    /// Only the first call has any effect; it returns `true`.
    pub fn close(&self, reason: CloseReason) -> bool {
        let closed = STATE_CLOSED_BASE + reason as u8;
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= STATE_CLOSED_BASE {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                closed,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.queue.close();
        self.closed.notify_waiters();
        debug!(
            subscriber = self.id,
            team = %self.team_id,
            reason = reason.as_str(),
            "Subscriber closed"
        );
        true
    }

    /// Wait until the subscriber is closed.
    pub async fn closed(&self) {
        let notified = self.closed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Queue an event for delivery.
    pub fn enqueue(&self, event: Arc<Event>) -> PushOutcome {
        self.queue.push(event)
    }

    /// Wait for the next queued event. Returns `None` once closed.
    pub async fn next_event(&self) -> Option<Arc<Event>> {
        self.queue.recv().await
    }
}

/// Registry handle identifying one registered subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberHandle {
    id: SubscriberId,
    team_id: String,
}

impl SubscriberHandle {
    /// Get the subscriber id.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Get the team id.
    #[must_use]
    pub fn team_id(&self) -> &str {
        &self.team_id
    }
}

/// Per-team subscriber registry.
///
/// Each team maps to its subscribers ordered by id, which is registration
/// order. Empty teams are pruned under the same map lock that registration
/// takes, so a subscriber arriving concurrently is never lost.
#[derive(Debug)]
pub struct Registry {
    teams: DashMap<String, BTreeMap<SubscriberId, Arc<Subscriber>>>,
    max_subscribers_per_team: usize,
}

impl Registry {
    /// Create a registry with a per-team subscriber limit (minimum 1).
    #[must_use]
    pub fn new(max_subscribers_per_team: usize) -> Self {
        Self {
            teams: DashMap::new(),
            max_subscribers_per_team: max_subscribers_per_team.max(1),
        }
    }

    /// Register a subscriber under its team.
    ///
    /// # Errors
    ///
    /// Returns an error if the team id is invalid or the team is full.
    pub fn register(&self, subscriber: Arc<Subscriber>) -> Result<SubscriberHandle, HubError> {
        validate_team_id(subscriber.team_id())?;

        let handle = SubscriberHandle {
            id: subscriber.id(),
            team_id: subscriber.team_id().to_string(),
        };

        let mut team = self.teams.entry(handle.team_id.clone()).or_default();
        if team.len() >= self.max_subscribers_per_team {
            return Err(HubError::TeamFull {
                team: handle.team_id,
                limit: self.max_subscribers_per_team,
            });
        }
        team.insert(handle.id, subscriber);
        let count = team.len();
        drop(team);

        debug!(
            team = %handle.team_id,
            subscriber = handle.id,
            subscribers = count,
            "Registered"
        );
        Ok(handle)
    }

    /// Remove a subscriber. Returns `false` if it was not registered.
    pub fn unregister(&self, handle: &SubscriberHandle) -> bool {
        let removed = match self.teams.get_mut(handle.team_id.as_str()) {
            Some(mut team) => team.remove(&handle.id).is_some(),
            None => false,
        };

        if removed {
            let pruned = self
                .teams
                .remove_if(handle.team_id.as_str(), |_, team| team.is_empty())
                .is_some();
            debug!(
                team = %handle.team_id,
                subscriber = handle.id,
                pruned,
                "Unregistered"
            );
        }
        removed
    }

    /// Point-in-time copy of a team's subscribers, in registration order.
    #[must_use]
    pub fn snapshot(&self, team_id: &str) -> Vec<Arc<Subscriber>> {
        self.teams
            .get(team_id)
            .map(|team| team.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Check whether a subscriber is registered.
    #[must_use]
    pub fn contains(&self, handle: &SubscriberHandle) -> bool {
        self.teams
            .get(handle.team_id.as_str())
            .is_some_and(|team| team.contains_key(&handle.id))
    }

    /// Number of subscribers for a team.
    #[must_use]
    pub fn subscriber_count(&self, team_id: &str) -> usize {
        self.teams.get(team_id).map(|team| team.len()).unwrap_or(0)
    }

    /// Check whether a team has an entry.
    #[must_use]
    pub fn team_exists(&self, team_id: &str) -> bool {
        self.teams.contains_key(team_id)
    }

    /// Close every registered subscriber. Returns how many were closed.
    ///
    /// Subscribers stay registered until their sessions unregister them.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let all: Vec<Arc<Subscriber>> = self
            .teams
            .iter()
            .flat_map(|team| team.values().cloned().collect::<Vec<_>>())
            .collect();

        all.iter().filter(|s| s.close(reason)).count()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            team_count: self.teams.len(),
            subscriber_count: self.teams.iter().map(|team| team.len()).sum(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Teams with at least one subscriber.
    pub team_count: usize,
    /// Registered subscribers across all teams.
    pub subscriber_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber(team: &str) -> Arc<Subscriber> {
        Arc::new(Subscriber::new(team, 8))
    }

    #[test]
    fn test_team_id_validation() {
        assert!(validate_team_id("team-demo-123").is_ok());
        assert!(validate_team_id("").is_err());
        assert!(validate_team_id("$system").is_err());
        assert!(validate_team_id("tab\there").is_err());

        let long = "a".repeat(MAX_TEAM_ID_LENGTH + 1);
        assert!(validate_team_id(&long).is_err());
    }

    #[test]
    fn test_register_and_snapshot_order() {
        let registry = Registry::new(16);
        let a = subscriber("team-a");
        let b = subscriber("team-a");
        let c = subscriber("team-b");

        registry.register(Arc::clone(&a)).unwrap();
        registry.register(Arc::clone(&b)).unwrap();
        registry.register(Arc::clone(&c)).unwrap();

        let ids: Vec<_> = registry.snapshot("team-a").iter().map(|s| s.id()).collect();
        assert_eq!(ids, [a.id(), b.id()]);
        assert_eq!(registry.subscriber_count("team-b"), 1);
        assert!(registry.snapshot("team-c").is_empty());
    }

    #[test]
    fn test_unregister_is_idempotent_and_prunes() {
        let registry = Registry::new(16);
        let handle = registry.register(subscriber("team-a")).unwrap();

        assert!(registry.contains(&handle));
        assert!(registry.unregister(&handle));
        assert!(!registry.unregister(&handle));
        assert!(!registry.contains(&handle));
        assert!(!registry.team_exists("team-a"));
        assert_eq!(registry.stats().team_count, 0);
    }

    #[test]
    fn test_snapshot_is_point_in_time() {
        let registry = Registry::new(16);
        let first = registry.register(subscriber("team-a")).unwrap();

        let snapshot = registry.snapshot("team-a");
        registry.register(subscriber("team-a")).unwrap();
        registry.unregister(&first);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), first.id());
        assert_eq!(registry.subscriber_count("team-a"), 1);
    }

    #[test]
    fn test_team_limit() {
        let registry = Registry::new(1);
        registry.register(subscriber("team-a")).unwrap();

        assert!(matches!(
            registry.register(subscriber("team-a")),
            Err(HubError::TeamFull { limit: 1, .. })
        ));
        assert!(registry.register(subscriber("team-b")).is_ok());
    }

    #[test]
    fn test_invalid_team_rejected() {
        let registry = Registry::new(4);
        assert!(matches!(
            registry.register(subscriber("")),
            Err(HubError::Validation(ValidationError::InvalidTeam(_)))
        ));
        assert_eq!(registry.stats().team_count, 0);
    }

    #[test]
    fn test_subscriber_close_once() {
        let sub = subscriber("team-a");
        assert_eq!(sub.state(), ConnectionState::Connecting);
        assert!(sub.mark_open());
        assert!(sub.is_open());

        assert!(sub.close(CloseReason::WriteFailed));
        assert!(!sub.close(CloseReason::Disconnected));
        assert_eq!(sub.close_reason(), Some(CloseReason::WriteFailed));
        assert!(sub.queue().is_closed());
        assert!(!sub.mark_open());
    }

    #[test]
    fn test_close_all() {
        let registry = Registry::new(16);
        registry.register(subscriber("team-a")).unwrap();
        registry.register(subscriber("team-b")).unwrap();

        assert_eq!(registry.close_all(CloseReason::Shutdown), 2);
        assert_eq!(registry.close_all(CloseReason::Shutdown), 0);
        assert!(registry
            .snapshot("team-a")
            .iter()
            .all(|s| s.close_reason() == Some(CloseReason::Shutdown)));
    }

    #[test]
    fn test_concurrent_register_unregister() {
        let registry = Arc::new(Registry::new(10_000));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let handle = registry.register(subscriber("busy")).unwrap();
                        assert!(registry.contains(&handle));
                        assert!(registry.unregister(&handle));
                        assert!(!registry.unregister(&handle));
                    }
                })
            })
            .collect();

        let survivor = registry.register(subscriber("busy")).unwrap();
        for worker in workers {
            worker.join().unwrap();
        }

        // Pruning must never have dropped the long-lived subscriber.
        assert!(registry.contains(&survivor));
        assert_eq!(registry.subscriber_count("busy"), 1);
    }

    #[tokio::test]
    async fn test_closed_resolves() {
        let sub = subscriber("team-a");
        let waiter = {
            let sub = Arc::clone(&sub);
            tokio::spawn(async move { sub.closed().await })
        };

        tokio::task::yield_now().await;
        sub.close(CloseReason::Unsubscribed);
        waiter.await.unwrap();

        // Already closed resolves immediately.
        sub.closed().await;
    }
}
