//! Cookie sessions for the demo login.
//!
//! Logging in creates a user on the fly and hands back an opaque token in
//! the `huddle_session` cookie. Sessions live in memory only, expire after
//! the configured lifetime and are capped in number.

use axum::http::{header, HeaderMap};
use chrono::{DateTime, Duration, Utc};
use dashmap::{DashMap, DashSet};
use huddle_core::registry::validate_team_id;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AuthConfig;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "huddle_session";

/// Maximum cookie header size accepted.
const MAX_COOKIE_SIZE: usize = 16 * 1024;

/// Authentication errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No valid session cookie.
    #[error("Authentication required")]
    Unauthenticated,

    /// The session belongs to a different team.
    #[error("Session is not a member of team {0}")]
    TeamMismatch(String),

    /// The team code does not name a known team.
    #[error("Unknown team")]
    UnknownTeam,
}

/// The user behind a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub team_id: String,
}

impl SessionUser {
    /// Resolve the team a request may stream, defaulting to the user's own.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::TeamMismatch`] if another team is requested.
    pub fn authorize_team(&self, requested: Option<&str>) -> Result<String, AuthError> {
        match requested {
            None | Some("") => Ok(self.team_id.clone()),
            Some(team) if team == self.team_id => Ok(self.team_id.clone()),
            Some(team) => Err(AuthError::TeamMismatch(team.to_string())),
        }
    }
}

#[derive(Debug)]
struct SessionEntry {
    user: SessionUser,
    expires_at: DateTime<Utc>,
}

/// In-memory session store.
#[derive(Debug)]
pub struct SessionStore {
    sessions: DashMap<String, SessionEntry>,
    teams: DashSet<String>,
    demo_team_code: String,
    demo_team_id: String,
    ttl: Duration,
    max_sessions: usize,
}

impl SessionStore {
    /// Create a store that knows only the demo team.
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        let teams = DashSet::new();
        teams.insert(config.demo_team_id.clone());
        Self {
            sessions: DashMap::new(),
            teams,
            demo_team_code: config.demo_team_code.clone(),
            demo_team_id: config.demo_team_id.clone(),
            ttl: Duration::hours(config.session_ttl_hours.max(1)),
            max_sessions: config.max_sessions.max(1),
        }
    }

    /// Session lifetime.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Make a team joinable by its id.
    pub fn add_team(&self, team_id: impl Into<String>) {
        self.teams.insert(team_id.into());
    }

    /// Resolve a team code to a known team id.
    ///
    /// The demo code is accepted in lower or upper case only.
    #[must_use]
    pub fn resolve_team(&self, team_code: &str) -> Option<String> {
        if team_code == self.demo_team_code || team_code == self.demo_team_code.to_uppercase() {
            return Some(self.demo_team_id.clone());
        }
        self.teams
            .contains(team_code)
            .then(|| team_code.to_string())
    }

    /// Create a user and a session for it.
    ///
    /// Returns the session token and the user.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::UnknownTeam`] if the team code resolves to no
    /// valid team.
    pub fn login(
        &self,
        name: &str,
        email: Option<String>,
        team_code: &str,
    ) -> Result<(String, SessionUser), AuthError> {
        let team_id = self
            .resolve_team(team_code)
            .filter(|team| validate_team_id(team).is_ok())
            .ok_or(AuthError::UnknownTeam)?;

        let user = SessionUser {
            id: format!("user-{}", Uuid::new_v4()),
            name: name.to_string(),
            email,
            team_id,
        };
        let token = Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        self.make_room(now);
        self.sessions.insert(
            token.clone(),
            SessionEntry {
                user: user.clone(),
                expires_at: now + self.ttl,
            },
        );

        info!(user = %user.id, team = %user.team_id, "User logged in");
        Ok((token, user))
    }

    /// Free a slot for a new session: drop expired sessions first, then the
    /// one closest to expiry.
    fn make_room(&self, now: DateTime<Utc>) {
        if self.sessions.len() < self.max_sessions {
            return;
        }
        self.prune_expired(now);
        if self.sessions.len() < self.max_sessions {
            return;
        }

        let oldest = self
            .sessions
            .iter()
            .min_by_key(|s| s.expires_at)
            .map(|s| s.key().clone());
        if let Some(token) = oldest {
            self.sessions.remove(&token);
            warn!(max_sessions = self.max_sessions, "Session limit reached, evicted oldest");
        }
    }

    /// Remove expired sessions, returning how many were removed.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.expires_at > now);
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            debug!(removed, "Pruned expired sessions");
        }
        removed
    }

    /// Look up a live session by token.
    #[must_use]
    pub fn user(&self, token: &str) -> Option<SessionUser> {
        self.user_at(token, Utc::now())
    }

    /// Look up a session as of `now`, dropping it if it has expired.
    #[must_use]
    pub fn user_at(&self, token: &str, now: DateTime<Utc>) -> Option<SessionUser> {
        let live = self
            .sessions
            .get(token)
            .map(|s| (s.expires_at > now).then(|| s.user.clone()))?;
        if live.is_none() {
            self.sessions.remove_if(token, |_, s| s.expires_at <= now);
            debug!("Session expired");
        }
        live
    }

    /// End a session. Returns `false` if it did not exist.
    pub fn logout(&self, token: &str) -> bool {
        let removed = self.sessions.remove(token).is_some();
        if removed {
            debug!("Session ended");
        }
        removed
    }

    /// Get the user of the session cookie on a request, if any.
    #[must_use]
    pub fn user_from_request(&self, headers: &HeaderMap) -> Option<SessionUser> {
        session_token(headers).and_then(|token| self.user(token))
    }

    /// Number of stored sessions, expired ones not yet pruned included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

/// Extract the session token from the request's cookies.
#[must_use]
pub fn session_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter(|value| value.len() <= MAX_COOKIE_SIZE)
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|cookie| cookie.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.trim_matches('"'))
}

/// `Set-Cookie` value establishing a session that lasts `max_age`.
#[must_use]
pub fn session_cookie(token: &str, max_age: Duration) -> String {
    format!(
        "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        max_age.num_seconds()
    )
}

/// `Set-Cookie` value clearing the session.
#[must_use]
pub fn clear_session_cookie() -> String {
    format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
}
