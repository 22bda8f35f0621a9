use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total commands executed. Labels: command, status.
pub const COMMANDS_TOTAL: &str = "fleetbook_commands_total";

/// Histogram: command latency in seconds. Labels: command.
pub const COMMAND_DURATION_SECONDS: &str = "fleetbook_command_duration_seconds";

// ── Booking lifecycle ───────────────────────────────────────────

pub const BOOKINGS_CREATED_TOTAL: &str = "fleetbook_bookings_created_total";
pub const BOOKINGS_MODIFIED_TOTAL: &str = "fleetbook_bookings_modified_total";
pub const BOOKINGS_CANCELED_TOTAL: &str = "fleetbook_bookings_canceled_total";

/// Counter: bookings moved to `completed` by reconciliation.
pub const BOOKINGS_COMPLETED_TOTAL: &str = "fleetbook_bookings_completed_total";

/// Counter: create/modify requests rejected for overlapping an active booking.
pub const BOOKING_CONFLICTS_TOTAL: &str = "fleetbook_booking_conflicts_total";

// ── Reconciliation ──────────────────────────────────────────────

/// Histogram: one `reconcile_expired` pass in seconds.
pub const RECONCILE_DURATION_SECONDS: &str = "fleetbook_reconcile_duration_seconds";

/// Counter: ticks skipped because the previous pass was still running.
pub const RECONCILE_SKIPPED_TOTAL: &str = "fleetbook_reconcile_skipped_total";

/// Counter: passes that returned an error.
pub const RECONCILE_FAILURES_TOTAL: &str = "fleetbook_reconcile_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "fleetbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "fleetbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "fleetbook_connections_rejected_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "fleetbook_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (records per flush).
pub const JOURNAL_BATCH_SIZE: &str = "fleetbook_journal_batch_size";

/// Counter: journal compactions.
pub const JOURNAL_COMPACTIONS_TOTAL: &str = "fleetbook_journal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::RegisterVehicle { .. } => "register_vehicle",
        Command::CreateBooking { .. } => "create_booking",
        Command::ModifyBooking { .. } => "modify_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SelectVehicles { .. } => "select_vehicles",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectRentalHistory { .. } => "select_rental_history",
        Command::SelectVehicleStatus { .. } => "select_vehicle_status",
    }
}
