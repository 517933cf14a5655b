use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "benb_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "benb_query_duration_seconds";

/// Counter: reservations persisted.
pub const RESERVATIONS_CREATED_TOTAL: &str = "benb_reservations_created_total";

/// Counter: reservation attempts that failed. Labels: kind (validation, unavailable, conflict, persistence).
pub const RESERVATIONS_FAILED_TOTAL: &str = "benb_reservations_failed_total";

/// Counter: reservations cancelled.
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "benb_reservations_cancelled_total";

/// Counter: quotes computed.
pub const QUOTES_TOTAL: &str = "benb_quotes_total";

// ── Ledger ──────────────────────────────────────────────────────

/// Counter: night claims lost to an already-taken or concurrently-taken night.
pub const LEDGER_CONFLICTS_TOTAL: &str = "benb_ledger_conflicts_total";

/// Counter: successful release batches.
pub const LEDGER_RELEASES_TOTAL: &str = "benb_ledger_releases_total";

/// Gauge: compensating releases waiting on the reconciler.
pub const RECONCILIATIONS_PENDING: &str = "benb_reconciliations_pending";

/// Counter: releases that exhausted their retries and need an operator.
pub const RECONCILIATIONS_MANUAL_TOTAL: &str = "benb_reconciliations_manual_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "benb_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "benb_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "benb_connections_rejected_total";

/// Counter: conditional writes rejected because a precondition failed.
pub const STORE_CONFLICTS_TOTAL: &str = "benb_store_conflicts_total";

/// Counter: store calls abandoned after the configured timeout.
pub const STORE_TIMEOUTS_TOTAL: &str = "benb_store_timeouts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "benb_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "benb_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::UpsertProperty { .. } => "upsert_property",
        Command::SelectProperties => "select_properties",
        Command::SetPricingPolicy { .. } => "set_pricing_policy",
        Command::SelectPricingPolicy { .. } => "select_pricing_policy",
        Command::UpsertSeason { .. } => "upsert_season",
        Command::DeleteSeason { .. } => "delete_season",
        Command::SelectSeasons { .. } => "select_seasons",
        Command::InsertBlock { .. } => "insert_block",
        Command::DeleteBlock { .. } => "delete_block",
        Command::InsertDayOverride { .. } => "insert_day_override",
        Command::SelectCalendar { .. } => "select_calendar",
        Command::SelectQuote { .. } => "select_quote",
        Command::SelectAvailability { .. } => "select_availability",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::SetReservationStatus { .. } => "set_reservation_status",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectLedgerReport { .. } => "select_ledger_report",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
