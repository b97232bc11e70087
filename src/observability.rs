use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── Booking flow ────────────────────────────────────────────────

/// Counter: booking submissions. Labels: outcome (ok, conflict, validation, ...).
pub const BOOKINGS_TOTAL: &str = "studiobook_bookings_total";

/// Counter: read-only availability checks that found a conflict.
pub const CONFLICTS_TOTAL: &str = "studiobook_conflicts_total";

/// Counter: approvals refused because the slot was taken meanwhile.
pub const APPROVAL_CONFLICTS_TOTAL: &str = "studiobook_approval_conflicts_total";

/// Counter: applied state transitions. Labels: from, to.
pub const TRANSITIONS_TOTAL: &str = "studiobook_transitions_total";

// ── Background work ─────────────────────────────────────────────

/// Counter: reservations promoted to passed by the sweep.
pub const SWEEP_PASSED_TOTAL: &str = "studiobook_sweep_passed_total";

/// Histogram: sweep pass duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "studiobook_sweep_duration_seconds";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "studiobook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "studiobook_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
