use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "caresched_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "caresched_query_duration_seconds";

// ── Scheduling outcomes ─────────────────────────────────────────

/// Counter: committed events. Labels: event.
pub const COMMITS_TOTAL: &str = "caresched_commits_total";

/// Counter: rejected mutations. Labels: op, code.
pub const REJECTIONS_TOTAL: &str = "caresched_rejections_total";

/// Counter: bookings or reschedules refused for overlap. Labels: code.
pub const CONFLICTS_TOTAL: &str = "caresched_conflicts_total";

/// Counter: commit retries. Labels: reason (`wal` or `version`).
pub const COMMIT_RETRIES_TOTAL: &str = "caresched_commit_retries_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "caresched_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "caresched_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "caresched_connections_rejected_total";

/// Gauge: practices with a loaded engine.
pub const PRACTICES_ACTIVE: &str = "caresched_practices_active";

/// Counter: startup failures (unknown practice, bad clinician id).
pub const AUTH_FAILURES_TOTAL: &str = "caresched_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "caresched_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "caresched_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label of a command for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::RegisterPatient { .. } => "register_patient",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::Reschedule { .. } => "reschedule",
        Command::SetStatus { .. } => "set_status",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::SelectAppointment { .. } => "select_appointment",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectConflicts { .. } => "select_conflicts",
    }
}
