// =============================================================================
// Metrics — Prometheus exporter wiring
// =============================================================================
//
// Thin wrapper around the `metrics` facade: call sites elsewhere in the
// crate use `metrics::counter!`/`gauge!`/`histogram!` directly, this module
// only owns installing the recorder and exposing the scrape endpoint.
// =============================================================================

use std::net::SocketAddr;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder and bind its scrape listener. Returns the
/// handle so callers could render `/metrics` manually if not using the
/// builder's own listener (we use the builder's, this is kept for tests).
pub fn install(port: u16) -> anyhow::Result<PrometheusHandle> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let handle = PrometheusBuilder::new().with_http_listener(addr).install_recorder()?;
    info!(port, "metrics exporter listening");
    Ok(handle)
}

/// Metric name constants, kept in one place so a rename doesn't require
/// grepping across call sites.
pub mod names {
    pub const TRADES_TOTAL: &str = "engine_trades_total";
    pub const ORDERS_SUBMITTED_TOTAL: &str = "engine_orders_submitted_total";
    pub const ORDERS_FAILED_TOTAL: &str = "engine_orders_failed_total";
    pub const ORDERS_TIMED_OUT_TOTAL: &str = "engine_orders_timed_out_total";
    pub const CIRCUIT_BREAKER_TRIPS_TOTAL: &str = "engine_circuit_breaker_trips_total";
    pub const STREAM_RECONNECTS_TOTAL: &str = "engine_stream_reconnects_total";
    pub const STREAM_SEQUENCE_GAPS_TOTAL: &str = "engine_stream_sequence_gaps_total";
    pub const EVENTS_DROPPED_TOTAL: &str = "engine_events_dropped_total";

    pub const OPEN_POSITIONS: &str = "engine_open_positions";
    pub const DAILY_PNL: &str = "engine_daily_pnl";
    pub const RISK_MODE: &str = "engine_risk_mode"; // 0 normal, 1 caution, 2 halted
    pub const PENDING_ORDERS: &str = "engine_pending_orders";
    pub const STREAM_STALENESS_MS: &str = "engine_stream_staleness_ms";

    pub const DECISION_LATENCY_SECONDS: &str = "engine_decision_latency_seconds";
    pub const PREDICT_LATENCY_SECONDS: &str = "engine_predict_latency_seconds";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_prefixed() {
        assert!(names::TRADES_TOTAL.starts_with("engine_"));
        assert!(names::DECISION_LATENCY_SECONDS.ends_with("_seconds"));
    }
}
