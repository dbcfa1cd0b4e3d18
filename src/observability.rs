use std::net::SocketAddr;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "tablewise_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "tablewise_http_request_duration_seconds";

/// Counter: hold acquisitions. Labels: outcome (ok, conflict, rejected).
pub const HOLDS_ACQUIRED_TOTAL: &str = "tablewise_holds_acquired_total";

/// Counter: holds confirmed into assignments.
pub const HOLDS_CONFIRMED_TOTAL: &str = "tablewise_holds_confirmed_total";

/// Counter: assignment attempts. Labels: trigger, outcome.
pub const ASSIGNMENT_ATTEMPTS_TOTAL: &str = "tablewise_assignment_attempts_total";

/// Histogram: end-to-end auto-assignment latency in seconds. Labels: trigger, outcome.
pub const ASSIGNMENT_DURATION_SECONDS: &str = "tablewise_assignment_duration_seconds";

// ── Background work ─────────────────────────────────────────────

/// Counter: holds removed by the sweeper.
pub const HOLDS_EXPIRED_TOTAL: &str = "tablewise_holds_expired_total";

/// Counter: assignments removed because their booking was cancelled or no-show.
pub const ASSIGNMENTS_PRUNED_TOTAL: &str = "tablewise_assignments_pruned_total";

/// Counter: outbox deliveries. Labels: outcome (done, retry, dead).
pub const OUTBOX_DELIVERIES_TOTAL: &str = "tablewise_outbox_deliveries_total";

/// Gauge: outbox rows waiting for delivery.
pub const OUTBOX_PENDING: &str = "tablewise_outbox_pending";

/// Counter: maintenance job runs. Labels: job, outcome.
pub const MAINTENANCE_RUNS_TOTAL: &str = "tablewise_maintenance_runs_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: number of loaded restaurants.
pub const RESTAURANTS_ACTIVE: &str = "tablewise_restaurants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tablewise_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tablewise_wal_flush_batch_size";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured filter when set.
pub fn init_tracing(filter: &str, json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init_metrics(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
