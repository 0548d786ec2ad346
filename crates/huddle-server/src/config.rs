//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults
//! - The first TOML file found among `huddle.toml`, `/etc/huddle/huddle.toml`
//!   and `~/.config/huddle/huddle.toml`
//! - Environment variables (`HUDDLE_PORT`, `HUDDLE_LIMITS__QUEUE_CAPACITY`, ...)

use anyhow::{Context, Result};
use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File, FileFormat};
use huddle_core::{HubConfig, OverflowPolicy};
use huddle_transport::SessionConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_PATHS: [&str; 3] = [
    "huddle.toml",
    "/etc/huddle/huddle.toml",
    "~/.config/huddle/huddle.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Event stream configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Reminder scanner configuration.
    #[serde(default)]
    pub reminders: ReminderConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Demo login configuration.
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Event stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path of the event stream endpoint.
    #[serde(default = "default_events_path")]
    pub events_path: String,

    /// Chunks buffered between a session and its response body.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,

    /// Reconnect delay advertised to clients, in milliseconds. 0 disables it.
    #[serde(default = "default_retry_ms")]
    pub retry_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Pending events held per subscriber.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum subscribers per team.
    #[serde(default = "default_max_subscribers_per_team")]
    pub max_subscribers_per_team: usize,

    /// What to do with subscribers that keep overflowing.
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Per-write timeout in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Reminder scanner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderConfig {
    /// Run sweeps on a timer. The cron endpoint works either way.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sweep interval in milliseconds.
    #[serde(default = "default_sweep_interval")]
    pub interval_ms: u64,

    /// How far ahead a meeting counts as due, in minutes.
    #[serde(default = "default_lookahead_minutes")]
    pub lookahead_minutes: i64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Demo login configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Team code that logs into the demo team.
    #[serde(default = "default_demo_team_code")]
    pub demo_team_code: String,

    /// Id of the demo team.
    #[serde(default = "default_demo_team_id")]
    pub demo_team_id: String,

    /// Session lifetime in hours.
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: i64,

    /// Maximum number of live sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_true() -> bool {
    true
}

fn default_events_path() -> String {
    "/api/sse".to_string()
}

fn default_stream_buffer() -> usize {
    huddle_transport::sse::DEFAULT_STREAM_BUFFER
}

fn default_retry_ms() -> u64 {
    3_000
}

fn default_queue_capacity() -> usize {
    HubConfig::default().queue_capacity
}

fn default_max_subscribers_per_team() -> usize {
    HubConfig::default().max_subscribers_per_team
}

fn default_heartbeat_interval() -> u64 {
    15_000
}

fn default_write_timeout() -> u64 {
    10_000
}

fn default_sweep_interval() -> u64 {
    60_000
}

fn default_lookahead_minutes() -> i64 {
    10
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_demo_team_code() -> String {
    "demo".to_string()
}

fn default_demo_team_id() -> String {
    "team-demo-123".to_string()
}

fn default_session_ttl_hours() -> i64 {
    24 * 7
}

fn default_max_sessions() -> usize {
    10_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            reminders: ReminderConfig::default(),
            metrics: MetricsConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            events_path: default_events_path(),
            stream_buffer: default_stream_buffer(),
            retry_ms: default_retry_ms(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_subscribers_per_team: default_max_subscribers_per_team(),
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_sweep_interval(),
            lookahead_minutes: default_lookahead_minutes(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            demo_team_code: default_demo_team_code(),
            demo_team_id: default_demo_team_id(),
            session_ttl_hours: default_session_ttl_hours(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl Config {
    /// Load configuration from the default file locations and the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or a
    /// value has the wrong type.
    pub fn load() -> Result<Self> {
        let file = CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());

        Self::layered(file.as_deref(), env_source())
    }

    fn layered(file: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        Self::build(builder.add_source(env))
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Hub settings.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            queue_capacity: self.limits.queue_capacity,
            max_subscribers_per_team: self.limits.max_subscribers_per_team,
            overflow_policy: self.limits.overflow_policy,
        }
    }

    /// Session timing.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat.interval_ms.max(1)),
            write_timeout: Duration::from_millis(self.heartbeat.write_timeout_ms.max(1)),
            retry: (self.transport.retry_ms > 0)
                .then(|| Duration::from_millis(self.transport.retry_ms)),
        }
    }

    /// Interval between timed reminder sweeps.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.reminders.interval_ms.max(1))
    }

    /// Reminder lookahead window.
    #[must_use]
    pub fn reminder_lookahead(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.reminders.lookahead_minutes.max(0))
    }
}

fn env_source() -> Environment {
    Environment::with_prefix("HUDDLE")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
