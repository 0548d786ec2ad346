//! HTTP handlers for the Huddle server.
//!
//! Routes the meetings API, the demo login, the reminder cron trigger and
//! the per-team event stream. Mutations broadcast to the team after the
//! store has been updated.

use crate::auth::{self, AuthError, SessionStore, SessionUser};
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use huddle_core::{
    EventPayload, Hub, HubError, Meeting, MeetingPatch, MeetingStore, MemoryMeetingStore,
    MemoryNotificationSink, NewMeeting, NotificationKey, NotificationKind, NotificationSink,
    NotifyError, ReminderScanner, StoreError, SweepOutcome, ValidationError,
};
use huddle_transport::{sse, Session, SessionError};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The team broadcast hub.
    pub hub: Arc<Hub>,
    /// Meeting persistence.
    pub meetings: Arc<dyn MeetingStore>,
    /// Outbound notifications.
    pub notifier: Arc<dyn NotificationSink>,
    /// Reminder sweeps.
    pub scanner: Arc<ReminderScanner>,
    /// Login sessions.
    pub sessions: SessionStore,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create app state backed by in-memory stores.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_backends(
            config,
            Arc::new(MemoryMeetingStore::new()),
            Arc::new(MemoryNotificationSink::new()),
        )
    }

    /// Create app state over the given store and sink.
    #[must_use]
    pub fn with_backends(
        config: Config,
        meetings: Arc<dyn MeetingStore>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let hub = Arc::new(Hub::with_config(config.hub_config()));
        let scanner = Arc::new(ReminderScanner::new(
            Arc::clone(&hub),
            Arc::clone(&meetings),
            Arc::clone(&notifier),
            config.reminder_lookahead(),
        ));

        Self {
            hub,
            meetings,
            notifier,
            scanner,
            sessions: SessionStore::new(&config.auth),
            config,
        }
    }

    /// Broadcast to a team, logging rather than failing the request.
    fn publish(&self, team_id: &str, payload: EventPayload) {
        match self.hub.broadcast(team_id, payload) {
            Ok(report) => metrics::record_broadcast(&report),
            Err(e) => {
                metrics::record_error("broadcast");
                warn!(team = %team_id, error = %e, "Broadcast rejected");
            }
        }
    }

    fn require_user(&self, headers: &HeaderMap) -> Result<SessionUser, ApiError> {
        self.sessions
            .user_from_request(headers)
            .ok_or(ApiError::Auth(AuthError::Unauthenticated))
    }

    /// Load a meeting the user's team owns.
    async fn team_meeting(&self, user: &SessionUser, id: &str) -> Result<Meeting, ApiError> {
        self.meetings
            .get_meeting(id)
            .await?
            .filter(|m| m.team_id == user.team_id)
            .ok_or(ApiError::NotFound)
    }
}

/// API errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Authentication or authorization failure.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Invalid request body.
    #[error("Invalid payload: {0}")]
    BadRequest(String),

    /// Rejected field values.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Resource not found.
    #[error("Not found")]
    NotFound,

    /// The stream could not be opened.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Meeting store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth(AuthError::Unauthenticated) => StatusCode::UNAUTHORIZED,
            Self::Auth(AuthError::TeamMismatch(_)) => StatusCode::FORBIDDEN,
            Self::Auth(AuthError::UnknownTeam) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Session(SessionError::Hub(e)) => hub_status(e),
            Self::Session(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Store(StoreError::Invalid(_)) => StatusCode::BAD_REQUEST,
            Self::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(AuthError::Unauthenticated) => "UNAUTHORIZED",
            Self::Auth(AuthError::TeamMismatch(_)) => "FORBIDDEN",
            Self::Auth(AuthError::UnknownTeam) => "UNKNOWN_TEAM",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Validation(_) | Self::Store(StoreError::Invalid(_)) => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Session(_) => "STREAM_UNAVAILABLE",
            Self::Store(_) => "STORE_ERROR",
        }
    }
}

fn hub_status(e: &HubError) -> StatusCode {
    match e {
        HubError::Validation(_) => StatusCode::BAD_REQUEST,
        HubError::TeamFull { .. } | HubError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            metrics::record_error(self.code());
            error!(error = %self, status = %status, "API error");
        } else {
            debug!(error = %self, status = %status, "Request rejected");
        }

        let body = json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.events_path, get(sse_handler))
        .route("/api/meetings", get(list_meetings).post(create_meeting))
        .route(
            "/api/meetings/:id",
            get(get_meeting).patch(update_meeting).delete(delete_meeting),
        )
        .route("/api/auth/login", axum::routing::post(login))
        .route("/api/auth/session", get(session_status).post(logout))
        .route("/api/cron/notifications", get(run_reminders).post(run_reminders))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP server until ctrl-c or SIGTERM.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let scanner_task = config
        .reminders
        .enabled
        .then(|| {
            Arc::clone(&state.scanner).spawn(
                config.sweep_interval(),
                stop_rx,
                metrics::record_sweep,
            )
        });

    let app = router(Arc::clone(&state));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Huddle server listening on {}", addr);
    info!("Event stream endpoint: http://{}{}", addr, config.transport.events_path);

    let hub = Arc::clone(&state.hub);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("Shutting down");
        // Open streams never finish on their own; closing them lets the
        // server drain.
        hub.shutdown();
        let _ = stop_tx.send(true);
    })
    .await?;

    if let Some(task) = scanner_task {
        task.await?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats();
    Json(json!({
        "status": if state.hub.is_shutting_down() { "shutting_down" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "teams": stats.team_count,
        "subscribers": stats.subscriber_count,
        "sessions": state.sessions.len(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamParams {
    team_id: Option<String>,
}

/// Open a team's event stream.
async fn sse_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<StreamParams>,
) -> Result<Response, ApiError> {
    let user = state.require_user(&headers)?;
    let team_id = user.authorize_team(params.team_id.as_deref())?;

    let (conn, body) = sse::channel(state.config.transport.stream_buffer);
    let conn = conn.with_remote_addr(remote.to_string());
    let session = Session::open(&state.hub, &team_id, conn, state.config.session_config()).await?;

    let stats = state.hub.stats();
    metrics::set_registry_stats(stats);
    debug!(
        user = %user.id,
        team = %team_id,
        subscriber = session.id(),
        subscribers = stats.subscriber_count,
        "Stream opened"
    );

    let hub = Arc::clone(&state.hub);
    tokio::spawn(async move {
        let _metrics_guard = ConnectionMetricsGuard::new();
        let reason = session.run().await;
        metrics::record_close(reason);
        metrics::set_registry_stats(hub.stats());
    });

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache, no-transform"),
        ],
        Body::from_stream(body),
    )
        .into_response())
}

async fn list_meetings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let user = state.require_user(&headers)?;
    let meetings = state.meetings.list_meetings(&user.team_id).await?;
    Ok(Json(json!({ "meetings": meetings })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateMeeting {
    title: String,
    description: Option<String>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    #[serde(default)]
    participant_emails: Vec<String>,
}

async fn create_meeting(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<CreateMeeting>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let user = state.require_user(&headers)?;
    let Json(req) = body?;

    let meeting = Meeting::create(
        NewMeeting {
            team_id: user.team_id.clone(),
            title: req.title,
            description: req.description,
            start: req.start,
            end: req.end,
            organizer_id: user.id.clone(),
            participant_emails: req.participant_emails,
        },
        Utc::now(),
    )?;
    state.meetings.upsert_meeting(meeting.clone()).await?;
    info!(meeting = %meeting.id, team = %meeting.team_id, "Meeting created");

    send_invitations(state.notifier.as_ref(), &meeting).await;
    info!(
        target: "huddle::outbox",
        topic = "meeting.created",
        meeting = %meeting.id,
        team = %meeting.team_id,
        "Outbox record"
    );
    state.publish(&meeting.team_id, EventPayload::MeetingCreated(meeting.clone()));

    Ok((StatusCode::CREATED, Json(json!({ "meeting": meeting }))))
}

/// Email every participant an invitation. Failures are logged per recipient.
async fn send_invitations(notifier: &dyn NotificationSink, meeting: &Meeting) {
    let subject = format!("Invitation: {}", meeting.title);
    let body = format!(
        "You are invited to a meeting from {} to {}.",
        meeting.start.format("%Y-%m-%d %H:%M UTC"),
        meeting.end.format("%Y-%m-%d %H:%M UTC")
    );

    let sends = meeting.participant_emails.iter().map(|recipient| {
        let subject = &subject;
        let body = &body;
        async move {
            let key = NotificationKey::new(&meeting.id, NotificationKind::Invite, recipient);
            notifier.send_notification(recipient, subject, body).await?;
            notifier.record_notification(&key).await?;
            Ok::<_, NotifyError>(())
        }
    });

    let mut sent = 0;
    for result in join_all(sends).await {
        match result {
            Ok(()) => sent += 1,
            Err(e) => {
                metrics::record_error("invite");
                warn!(meeting = %meeting.id, error = %e, "Invitation failed");
            }
        }
    }
    metrics::record_invites(sent);
}

async fn get_meeting(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user = state.require_user(&headers)?;
    let meeting = state.team_meeting(&user, &id).await?;
    Ok(Json(json!({ "meeting": meeting })))
}

async fn update_meeting(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<MeetingPatch>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let user = state.require_user(&headers)?;
    state.team_meeting(&user, &id).await?;
    let Json(patch) = body?;

    let updated = state.meetings.update_meeting(&id, patch, Utc::now()).await?;
    state.publish(&updated.team_id, EventPayload::MeetingUpdated(updated.clone()));

    Ok(Json(json!({ "meeting": updated })))
}

async fn delete_meeting(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let user = state.require_user(&headers)?;
    let meeting = state.team_meeting(&user, &id).await?;

    if state.meetings.delete_meeting(&meeting.id).await?.is_some() {
        state.publish(&meeting.team_id, EventPayload::MeetingDeleted { id: meeting.id });
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    name: String,
    email: Option<String>,
    team_code: String,
}

async fn login(
    State(state): State<Arc<AppState>>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = body?;
    let name = req.name.trim();
    if name.is_empty() || req.team_code.is_empty() {
        return Err(ApiError::BadRequest("name and teamCode are required".into()));
    }
    if req.email.as_deref().is_some_and(|e| !e.contains('@')) {
        return Err(ApiError::BadRequest("invalid email".into()));
    }

    let (token, user) = state.sessions.login(name, req.email, &req.team_code)?;

    Ok((
        [(header::SET_COOKIE, auth::session_cookie(&token, state.sessions.ttl()))],
        Json(json!({
            "user": { "id": user.id, "name": user.name, "teamId": user.team_id }
        })),
    )
        .into_response())
}

async fn session_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Json<Value> {
    match state.sessions.user_from_request(&headers) {
        Some(user) => Json(json!({ "authenticated": true, "user": user })),
        None => Json(json!({ "authenticated": false })),
    }
}

async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(token) = auth::session_token(&headers) {
        state.sessions.logout(token);
    }
    (
        [(header::SET_COOKIE, auth::clear_session_cookie())],
        Json(json!({ "ok": true })),
    )
        .into_response()
}

/// Run one reminder sweep now.
async fn run_reminders(State(state): State<Arc<AppState>>) -> Json<Value> {
    let outcome = state.scanner.sweep(Utc::now()).await;
    metrics::record_sweep(&outcome);
    match outcome {
        SweepOutcome::Completed(report) => {
            Json(json!({
                "ok": true,
                "processed": report.due,
                "report": report,
            }))
        }
        SweepOutcome::Skipped => Json(json!({ "ok": true, "skipped": true })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::BodyDataStream;
    use axum::http::HeaderValue;
    use futures_util::StreamExt;
    use huddle_core::EventKind;
    use huddle_protocol::{codec, Frame};

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(Config::default()))
    }

    fn signed_in(state: &AppState, team_code: &str) -> (HeaderMap, SessionUser) {
        let (token, user) = state.sessions.login("Ana", None, team_code).unwrap();
        let mut headers = HeaderMap::new();
        let cookie = auth::session_cookie(&token, state.sessions.ttl());
        headers.insert(header::COOKIE, HeaderValue::from_str(&cookie).unwrap());
        (headers, user)
    }

    fn create_body(title: &str, start: DateTime<Utc>, emails: &[&str]) -> CreateMeeting {
        CreateMeeting {
            title: title.into(),
            description: None,
            start,
            end: start + chrono::Duration::minutes(30),
            participant_emails: emails.iter().map(|e| e.to_string()).collect(),
        }
    }

    /// Decode the first frame of the next chunk.
    async fn next_frame(stream: &mut BodyDataStream) -> Frame {
        let chunk = stream.next().await.unwrap().unwrap();
        codec::decode(&chunk).unwrap()
    }

    fn client() -> ConnectInfo<SocketAddr> {
        ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 51000)))
    }

    fn rejected<T>(result: Result<T, ApiError>) -> ApiError {
        match result {
            Ok(_) => panic!("expected the request to be rejected"),
            Err(e) => e,
        }
    }

    #[tokio::test]
    async fn test_stream_requires_session() {
        let state = state();
        let err = rejected(
            sse_handler(
                State(Arc::clone(&state)),
                client(),
                HeaderMap::new(),
                Query(StreamParams { team_id: None }),
            )
            .await,
        );
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_stream_rejects_other_team() {
        let state = state();
        let (headers, _) = signed_in(&state, "demo");

        let err = rejected(
            sse_handler(
                State(Arc::clone(&state)),
                client(),
                headers,
                Query(StreamParams {
                    team_id: Some("team-other".into()),
                }),
            )
            .await,
        );
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(state.hub.stats().subscriber_count, 0);
    }

    #[tokio::test]
    async fn test_stream_unavailable_during_shutdown() {
        let state = state();
        let (headers, _) = signed_in(&state, "demo");
        state.hub.shutdown();

        let err = rejected(
            sse_handler(
                State(state),
                client(),
                headers,
                Query(StreamParams { team_id: None }),
            )
            .await,
        );
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_created_meeting_is_streamed() {
        let state = state();
        let (headers, user) = signed_in(&state, "demo");

        let response = sse_handler(
            State(Arc::clone(&state)),
            client(),
            headers.clone(),
            Query(StreamParams {
                team_id: Some(user.team_id.clone()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        let mut body = response.into_body().into_data_stream();
        // The handshake chunk leads with the retry hint.
        assert!(matches!(next_frame(&mut body).await, Frame::Retry { millis: 3000 }));

        let (status, Json(created)) = create_meeting(
            State(Arc::clone(&state)),
            headers,
            Ok(Json(create_body("Planning", Utc::now(), &["bo@example.com"]))),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        let id = created["meeting"]["id"].as_str().unwrap().to_string();

        match next_frame(&mut body).await {
            Frame::Event { event, data, .. } => {
                assert_eq!(event, "meeting.created");
                let payload: Value = serde_json::from_str(&data).unwrap();
                assert_eq!(payload["id"], json!(id));
                assert_eq!(payload["title"], json!("Planning"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_meeting_crud_is_team_scoped() {
        let state = state();
        state.sessions.add_team("team-b");
        let (a, _) = signed_in(&state, "demo");
        let (b, _) = signed_in(&state, "team-b");

        let (_, Json(created)) = create_meeting(
            State(Arc::clone(&state)),
            a.clone(),
            Ok(Json(create_body("Retro", Utc::now(), &[]))),
        )
        .await
        .unwrap();
        let id = created["meeting"]["id"].as_str().unwrap().to_string();

        let err = get_meeting(State(Arc::clone(&state)), b.clone(), Path(id.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let Json(listed) = list_meetings(State(Arc::clone(&state)), b).await.unwrap();
        assert_eq!(listed["meetings"], json!([]));

        let patch = MeetingPatch {
            title: Some("Retro v2".into()),
            ..MeetingPatch::default()
        };
        let Json(updated) = update_meeting(
            State(Arc::clone(&state)),
            a.clone(),
            Path(id.clone()),
            Ok(Json(patch)),
        )
        .await
        .unwrap();
        assert_eq!(updated["meeting"]["title"], json!("Retro v2"));

        let status = delete_meeting(State(Arc::clone(&state)), a.clone(), Path(id.clone()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let err = get_meeting(State(state), a, Path(id)).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_meeting_is_rejected() {
        let state = state();
        let (headers, _) = signed_in(&state, "demo");
        let start = Utc::now();

        let mut body = create_body("  ", start, &[]);
        let err = create_meeting(State(Arc::clone(&state)), headers.clone(), Ok(Json(body)))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        body = create_body("Sync", start, &[]);
        body.end = start - chrono::Duration::minutes(1);
        let err = create_meeting(State(state), headers, Ok(Json(body)))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_invitations_and_reminders() {
        let sink = Arc::new(MemoryNotificationSink::new());
        let state = Arc::new(AppState::with_backends(
            Config::default(),
            Arc::new(MemoryMeetingStore::new()),
            Arc::clone(&sink) as Arc<dyn NotificationSink>,
        ));
        let (headers, _) = signed_in(&state, "demo");

        create_meeting(
            State(Arc::clone(&state)),
            headers,
            Ok(Json(create_body(
                "Standup",
                Utc::now() + chrono::Duration::minutes(5),
                &["a@example.com", "b@example.com"],
            ))),
        )
        .await
        .unwrap();
        assert_eq!(sink.sent_count(), 2);
        assert!(sink.sent()[0].subject.starts_with("Invitation: Standup"));

        let Json(first) = run_reminders(State(Arc::clone(&state))).await;
        assert_eq!(first["processed"], json!(1));
        assert_eq!(sink.sent_count(), 4);

        let Json(second) = run_reminders(State(state)).await;
        assert_eq!(second["processed"], json!(0));
        assert_eq!(sink.sent_count(), 4);
    }

    #[tokio::test]
    async fn test_edit_after_reminder_does_not_rebroadcast() {
        let state = state();
        let (headers, user) = signed_in(&state, "demo");
        let team = state.hub.subscribe(&user.team_id).unwrap();

        let (_, Json(created)) = create_meeting(
            State(Arc::clone(&state)),
            headers.clone(),
            Ok(Json(create_body(
                "Standup",
                Utc::now() + chrono::Duration::minutes(5),
                &["a@example.com"],
            ))),
        )
        .await
        .unwrap();
        let id = created["meeting"]["id"].as_str().unwrap().to_string();

        let Json(first) = run_reminders(State(Arc::clone(&state))).await;
        assert_eq!(first["processed"], json!(1));

        let patch = MeetingPatch {
            title: Some("Standup (moved room)".into()),
            ..MeetingPatch::default()
        };
        let Json(updated) = update_meeting(
            State(Arc::clone(&state)),
            headers.clone(),
            Path(id.clone()),
            Ok(Json(patch)),
        )
        .await
        .unwrap();
        assert!(updated["meeting"]["reminderSentAt"].is_string());

        let Json(second) = run_reminders(State(Arc::clone(&state))).await;
        assert_eq!(second["processed"], json!(0));

        let kinds: Vec<_> = std::iter::from_fn(|| team.subscriber().queue().try_recv())
            .map(|e| e.kind())
            .collect();
        assert_eq!(
            kinds,
            [
                EventKind::MeetingCreated,
                EventKind::MeetingReminder,
                EventKind::MeetingUpdated
            ]
        );

        let invalid = MeetingPatch {
            end: Some(Utc::now() - chrono::Duration::hours(1)),
            ..MeetingPatch::default()
        };
        let err = update_meeting(State(state), headers, Path(id), Ok(Json(invalid)))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let state = state();
        signed_in(&state, "demo");
        let _subscription = state.hub.subscribe("team-demo-123").unwrap();

        let body = health_handler(State(state)).await.into_response().into_body();
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        let health: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(health["status"], json!("ok"));
        assert_eq!(health["subscribers"], json!(1));
        assert_eq!(health["sessions"], json!(1));
    }

    #[tokio::test]
    async fn test_login_and_logout() {
        let state = state();

        let err = rejected(
            login(
                State(Arc::clone(&state)),
                Ok(Json(LoginRequest {
                    name: "Ana".into(),
                    email: None,
                    team_code: "nope".into(),
                })),
            )
            .await,
        );
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let response = login(
            State(Arc::clone(&state)),
            Ok(Json(LoginRequest {
                name: "Ana".into(),
                email: Some("ana@example.com".into()),
                team_code: "DEMO".into(),
            })),
        )
        .await
        .unwrap();
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.contains("Max-Age=604800"));
        let token = cookie
            .split(';')
            .next()
            .and_then(|c| c.strip_prefix("huddle_session="))
            .unwrap()
            .to_string();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("huddle_session={token}")).unwrap(),
        );
        let Json(status) = session_status(State(Arc::clone(&state)), headers.clone()).await;
        assert_eq!(status["authenticated"], json!(true));
        assert_eq!(status["user"]["teamId"], json!("team-demo-123"));

        logout(State(Arc::clone(&state)), headers.clone()).await;
        let Json(status) = session_status(State(state), headers).await;
        assert_eq!(status, json!({ "authenticated": false }));
    }
}
