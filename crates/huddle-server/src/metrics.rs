//! Metrics collection and export for Huddle.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use huddle_core::{BroadcastReport, CloseReason, RegistryStats, SweepOutcome};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "huddle_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "huddle_connections_active";
    pub const DISCONNECTS_TOTAL: &str = "huddle_disconnects_total";
    pub const EVENTS_TOTAL: &str = "huddle_events_total";
    pub const EVENTS_DROPPED: &str = "huddle_events_dropped_total";
    pub const FANOUT_SUBSCRIBERS: &str = "huddle_fanout_subscribers";
    pub const TEAMS_ACTIVE: &str = "huddle_teams_active";
    pub const SWEEPS_TOTAL: &str = "huddle_reminder_sweeps_total";
    pub const NOTIFICATIONS_TOTAL: &str = "huddle_notifications_total";
    pub const ERRORS_TOTAL: &str = "huddle_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of event stream connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open event streams"
    );
    metrics::describe_counter!(names::DISCONNECTS_TOTAL, "Closed event streams by reason");
    metrics::describe_counter!(names::EVENTS_TOTAL, "Events broadcast, by kind");
    metrics::describe_counter!(
        names::EVENTS_DROPPED,
        "Queued events discarded because a subscriber fell behind"
    );
    metrics::describe_histogram!(
        names::FANOUT_SUBSCRIBERS,
        "Subscribers reached by a single broadcast"
    );
    metrics::describe_gauge!(names::TEAMS_ACTIVE, "Teams with at least one subscriber");
    metrics::describe_counter!(names::SWEEPS_TOTAL, "Reminder sweeps by outcome");
    metrics::describe_counter!(names::NOTIFICATIONS_TOTAL, "Notifications sent, by kind");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record why a stream closed.
pub fn record_close(reason: CloseReason) {
    counter!(names::DISCONNECTS_TOTAL, "reason" => reason.as_str()).increment(1);
}

/// Record a broadcast.
pub fn record_broadcast(report: &BroadcastReport) {
    counter!(names::EVENTS_TOTAL, "kind" => report.kind.as_str()).increment(1);
    histogram!(names::FANOUT_SUBSCRIBERS).record(report.delivered as f64);
    if report.dropped > 0 {
        counter!(names::EVENTS_DROPPED).increment(report.dropped as u64);
    }
}

/// Update registry gauges.
pub fn set_registry_stats(stats: RegistryStats) {
    gauge!(names::TEAMS_ACTIVE).set(stats.team_count as f64);
}

/// Record a reminder sweep.
pub fn record_sweep(outcome: &SweepOutcome) {
    match outcome {
        SweepOutcome::Completed(report) => {
            counter!(names::SWEEPS_TOTAL, "outcome" => "completed").increment(1);
            counter!(names::NOTIFICATIONS_TOTAL, "kind" => "reminder")
                .increment(report.notifications_sent as u64);
            if report.failed > 0 {
                record_error("reminder");
            }
        }
        SweepOutcome::Skipped => {
            counter!(names::SWEEPS_TOTAL, "outcome" => "skipped").increment(1);
        }
    }
}

/// Record sent invitations.
pub fn record_invites(count: usize) {
    counter!(names::NOTIFICATIONS_TOTAL, "kind" => "invite").increment(count as u64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
