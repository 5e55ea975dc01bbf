use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: engine operations. Labels: op, outcome (`ok` or an error category).
pub const OPERATIONS_TOTAL: &str = "openshelf_operations_total";

/// Histogram: operation latency in seconds, lock wait included. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "openshelf_operation_duration_seconds";

// ── Sweeper ─────────────────────────────────────────────────────

/// Counter: holds flipped to `expired`.
pub const HOLDS_EXPIRED_TOTAL: &str = "openshelf_holds_expired_total";

/// Counter: reclaims that failed and were left for the next tick.
pub const SWEEP_FAILURES_TOTAL: &str = "openshelf_sweep_failures_total";

/// Histogram: duration of one sweep in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "openshelf_sweep_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active holds after the last sweep.
pub const ACTIVE_HOLDS: &str = "openshelf_active_holds";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "openshelf_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "openshelf_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}
