use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "roombook_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "roombook_request_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roombook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roombook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roombook_connections_rejected_total";

/// Counter: failed logins and rejected tokens.
pub const AUTH_FAILURES_TOTAL: &str = "roombook_auth_failures_total";

// ── Booking ─────────────────────────────────────────────────────

/// Counter: reservations created. Labels: status.
pub const RESERVATIONS_CREATED_TOTAL: &str = "roombook_reservations_created_total";

/// Counter: create attempts rejected because the period was taken.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "roombook_reservation_conflicts_total";

/// Counter: reservations moved to cancelled.
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "roombook_reservations_cancelled_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roombook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roombook_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: result.
pub const WAL_COMPACTIONS_TOTAL: &str = "roombook_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on port {port}: {e}"),
    }
}
