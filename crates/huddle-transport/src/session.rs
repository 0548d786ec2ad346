//! Streaming session: one subscriber connection from handshake to teardown.
//!
//! A session registers with the hub, writes the stream handshake and then
//! runs a single task that drains the subscriber's queue, sends heartbeats
//! and watches for the client going away. Whatever ends the session first
//! decides the close reason; teardown happens exactly once.

use bytes::{Bytes, BytesMut};
use huddle_core::{
    CloseReason, ConnectionState, Hub, HubError, Subscriber, SubscriberId, Subscription,
};
use huddle_protocol::{codec, Frame, ProtocolError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::traits::{Connection, TransportError};

/// Session timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Interval between keep-alive comments.
    pub heartbeat_interval: Duration,
    /// Longest a single write may take before the client is dropped.
    pub write_timeout: Duration,
    /// Reconnect delay advertised to the client, if any.
    pub retry: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            write_timeout: Duration::from_secs(10),
            retry: Some(Duration::from_secs(3)),
        }
    }
}

/// Errors opening a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The hub refused the subscription.
    #[error(transparent)]
    Hub(#[from] HubError),

    /// The handshake could not be encoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The handshake could not be written.
    #[error("Handshake failed: {0}")]
    Handshake(#[source] TransportError),

    /// The subscriber was closed before the handshake completed.
    #[error("Subscriber closed during handshake: {}", .0.as_str())]
    Closed(CloseReason),
}

/// Remote control for a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    subscriber: Arc<Subscriber>,
}

impl SessionHandle {
    /// Get the subscriber id.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.subscriber.id()
    }

    /// End the session as an explicit unsubscribe.
    ///
    /// Returns `false` if the session was already closing.
    pub fn close(&self) -> bool {
        self.subscriber.close(CloseReason::Unsubscribed)
    }

    /// Check if the session has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.subscriber.is_closed()
    }
}

/// An open streaming session.
pub struct Session<C> {
    subscription: Subscription,
    conn: C,
    config: SessionConfig,
    keep_alive: Bytes,
}

impl<C: Connection> Session<C> {
    /// Subscribe to a team and write the stream handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub refuses the subscription or the handshake
    /// cannot be written. The subscriber is unregistered in either case.
    pub async fn open(
        hub: &Hub,
        team_id: &str,
        mut conn: C,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let subscription = hub.subscribe(team_id)?;
        let subscriber = subscription.subscriber();

        let handshake = handshake(subscriber.id(), config.retry)?;
        let keep_alive = codec::encode(&Frame::keep_alive())?;

        if let Err(e) = write(&mut conn, handshake, config.write_timeout).await {
            subscription.close(CloseReason::HandshakeFailed);
            return Err(SessionError::Handshake(e));
        }

        if !subscriber.mark_open() {
            let reason = subscriber
                .close_reason()
                .unwrap_or(CloseReason::HandshakeFailed);
            subscription.close(reason);
            return Err(SessionError::Closed(reason));
        }
        subscriber.touch();

        info!(
            subscriber = subscriber.id(),
            team = %team_id,
            remote = conn.remote_addr().as_deref().unwrap_or("-"),
            "Session opened"
        );

        Ok(Self {
            subscription,
            conn,
            config,
            keep_alive,
        })
    }

    /// Get the subscriber id.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.subscription.id()
    }

    /// Get the team id.
    #[must_use]
    pub fn team_id(&self) -> &str {
        self.subscription.handle().team_id()
    }

    /// Get the client's address, if the connection knows it.
    #[must_use]
    pub fn remote_addr(&self) -> Option<String> {
        self.conn.remote_addr()
    }

    /// Get the connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.subscription.subscriber().state()
    }

    /// Get a handle that can close the session from elsewhere.
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            subscriber: Arc::clone(self.subscription.subscriber()),
        }
    }

    /// Drive the session until it closes, returning why it closed.
    pub async fn run(self) -> CloseReason {
        let Self {
            subscription,
            mut conn,
            config,
            keep_alive,
        } = self;
        let subscriber = Arc::clone(subscription.subscriber());

        let mut heartbeat = interval_at(
            Instant::now() + config.heartbeat_interval,
            config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                biased;

                _ = subscriber.closed() => {
                    break subscriber.close_reason().unwrap_or(CloseReason::Unsubscribed);
                }

                _ = conn.closed() => break CloseReason::Disconnected,

                event = subscriber.next_event() => {
                    let Some(event) = event else {
                        break subscriber.close_reason().unwrap_or(CloseReason::Unsubscribed);
                    };
                    tokio::select! {
                        biased;
                        _ = subscriber.closed() => {
                            break subscriber.close_reason().unwrap_or(CloseReason::Unsubscribed);
                        }
                        written = write(&mut conn, event.wire().clone(), config.write_timeout) => {
                            if let Err(e) = written {
                                warn!(subscriber = subscriber.id(), event = event.id, error = %e, "Event write failed");
                                break CloseReason::WriteFailed;
                            }
                        }
                    }
                    subscriber.touch();
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = write(&mut conn, keep_alive.clone(), config.write_timeout).await {
                        debug!(subscriber = subscriber.id(), error = %e, "Heartbeat write failed");
                        break CloseReason::WriteFailed;
                    }
                }
            }
        };

        subscription.close(reason);
        let reason = subscriber.close_reason().unwrap_or(reason);

        info!(
            subscriber = subscriber.id(),
            team = %subscriber.team_id(),
            reason = reason.as_str(),
            "Session closed"
        );
        reason
    }
}

fn handshake(id: SubscriberId, retry: Option<Duration>) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(48);
    if let Some(retry) = retry {
        let millis = u64::try_from(retry.as_millis()).unwrap_or(u64::MAX);
        codec::encode_into(&Frame::retry(millis), &mut buf)?;
    }
    codec::encode_into(&Frame::comment(format!("connected {id}")), &mut buf)?;
    Ok(buf.freeze())
}

async fn write<C: Connection>(
    conn: &mut C,
    data: Bytes,
    limit: Duration,
) -> Result<(), TransportError> {
    match timeout(limit, conn.send_raw(data)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::{self, SseBody};
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use huddle_core::EventPayload;

    fn deleted(id: &str) -> EventPayload {
        EventPayload::MeetingDeleted { id: id.into() }
    }

    async fn next_frame(body: &mut SseBody) -> Frame {
        let chunk = body.next().await.unwrap().unwrap();
        codec::decode(&chunk).unwrap()
    }

    fn config() -> SessionConfig {
        SessionConfig {
            retry: None,
            ..SessionConfig::default()
        }
    }

    async fn open(hub: &Hub, team: &str) -> (Session<sse::SseConnection>, SseBody) {
        let (conn, mut body) = sse::channel(16);
        let session = Session::open(hub, team, conn, config()).await.unwrap();
        // Skip the handshake.
        body.next().await.unwrap().unwrap();
        (session, body)
    }

    #[tokio::test]
    async fn test_session_keeps_client_address() {
        let hub = Hub::new();
        let (conn, _body) = sse::channel(4);
        let conn = conn.with_remote_addr("192.0.2.7:51000");

        let session = Session::open(&hub, "team", conn, config()).await.unwrap();
        assert_eq!(session.remote_addr().as_deref(), Some("192.0.2.7:51000"));

        let (bare, _bare_body) = sse::channel(4);
        let anonymous = Session::open(&hub, "team", bare, config()).await.unwrap();
        assert_eq!(anonymous.remote_addr(), None);
    }

    #[tokio::test]
    async fn test_handshake() {
        let hub = Hub::new();
        let (conn, mut body) = sse::channel(4);
        let session = Session::open(&hub, "team", conn, SessionConfig::default())
            .await
            .unwrap();

        assert_eq!(session.state(), ConnectionState::Open);
        assert_eq!(session.team_id(), "team");
        assert_eq!(hub.registry().subscriber_count("team"), 1);

        let chunk = body.next().await.unwrap().unwrap();
        let expected = format!("retry: 3000\n\n: connected {}\n\n", session.id());
        assert_eq!(chunk, Bytes::from(expected));
    }

    #[tokio::test]
    async fn test_events_written_in_order() {
        let hub = Arc::new(Hub::new());
        let (session, mut body) = open(&hub, "team").await;
        let task = tokio::spawn(session.run());

        for id in ["m1", "m2", "m3"] {
            hub.broadcast("team", deleted(id)).unwrap();
        }

        for id in ["m1", "m2", "m3"] {
            match next_frame(&mut body).await {
                Frame::Event { event, data, id: Some(_) } => {
                    assert_eq!(event, "meeting.deleted");
                    assert_eq!(data, format!(r#"{{"id":"{id}"}}"#));
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }

        drop(body);
        assert_eq!(task.await.unwrap(), CloseReason::Disconnected);
        assert_eq!(hub.registry().subscriber_count("team"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat() {
        let hub = Hub::new();
        let (session, mut body) = open(&hub, "team").await;
        let handle = session.handle();
        let task = tokio::spawn(session.run());

        let started = Instant::now();
        assert!(next_frame(&mut body).await.is_keep_alive());
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert!(next_frame(&mut body).await.is_keep_alive());

        assert!(handle.close());
        assert_eq!(task.await.unwrap(), CloseReason::Unsubscribed);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_connection() {
        let hub = Hub::new();
        let (session, _body) = open(&hub, "team").await;
        let handle = session.handle();
        let task = tokio::spawn(session.run());

        handle.close();
        assert_eq!(task.await.unwrap(), CloseReason::Unsubscribed);
        assert!(!handle.close());
        assert!(!hub.registry().team_exists("team"));
    }

    #[tokio::test]
    async fn test_hub_shutdown_ends_session() {
        let hub = Hub::new();
        let (session, _body) = open(&hub, "team").await;
        let task = tokio::spawn(session.run());

        hub.shutdown();
        assert_eq!(task.await.unwrap(), CloseReason::Shutdown);
        assert!(matches!(
            Session::open(&hub, "team", sse::channel(1).0, config()).await,
            Err(SessionError::Hub(HubError::ShuttingDown))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_client_times_out() {
        let hub = Hub::new();
        let (conn, _body) = sse::channel(1);
        let session = Session::open(
            &hub,
            "team",
            conn,
            SessionConfig {
                write_timeout: Duration::from_secs(2),
                ..config()
            },
        )
        .await
        .unwrap();
        let task = tokio::spawn(session.run());

        // The handshake fills the only slot; nobody reads the body.
        hub.broadcast("team", deleted("m1")).unwrap();

        assert_eq!(task.await.unwrap(), CloseReason::WriteFailed);
        assert_eq!(hub.registry().subscriber_count("team"), 0);
    }

    /// Connection that accepts the handshake, then fails every write.
    struct BrokenConnection {
        writes: usize,
    }

    #[async_trait]
    impl Connection for BrokenConnection {
        async fn send_raw(&mut self, _data: Bytes) -> Result<(), TransportError> {
            self.writes += 1;
            if self.writes > 1 {
                return Err(TransportError::SendFailed("connection reset".into()));
            }
            Ok(())
        }

        async fn closed(&self) {
            std::future::pending::<()>().await;
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_write_failure_removes_connection() {
        let hub = Hub::new();
        let session = Session::open(&hub, "team", BrokenConnection { writes: 0 }, config())
            .await
            .unwrap();
        let other = hub.subscribe("team").unwrap();
        let task = tokio::spawn(session.run());

        hub.broadcast("team", deleted("m1")).unwrap();
        assert_eq!(task.await.unwrap(), CloseReason::WriteFailed);

        let report = hub.broadcast("team", deleted("m2")).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(hub.registry().snapshot("team").len(), 1);
        assert_eq!(other.subscriber().queue().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_handshake_unregisters() {
        let hub = Hub::new();
        let (conn, body) = sse::channel(1);
        drop(body);

        let result = Session::open(&hub, "team", conn, config()).await;
        assert!(matches!(
            result,
            Err(SessionError::Handshake(TransportError::ConnectionClosed))
        ));
        assert!(!hub.registry().team_exists("team"));
    }

    #[tokio::test]
    async fn test_invalid_team_is_rejected() {
        let hub = Hub::new();
        let result = Session::open(&hub, "", sse::channel(1).0, config()).await;
        assert!(matches!(
            result,
            Err(SessionError::Hub(HubError::Validation(_)))
        ));
    }
}
