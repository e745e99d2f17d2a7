//! Prometheus counters.

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use telemetry_metrics::{counter, describe_counter};
use tracing::warn;

/// HTTP requests by route, method and status.
pub const HTTP_REQUESTS_TOTAL: &str = "gateway_http_requests_total";
/// Successful WebSocket upgrades.
pub const WS_CONNECTIONS_TOTAL: &str = "gateway_ws_connections_total";
/// Rejected credentials.
pub const TOKEN_VALIDATION_FAILURES_TOTAL: &str = "gateway_token_validation_failures_total";
/// Requests refused by admission control.
pub const RATE_LIMITED_TOTAL: &str = "gateway_rate_limited_total";

static PROMETHEUS: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder once and return its handle.
///
/// If another recorder is already installed, a detached recorder is used so
/// the endpoint still renders (without this process's counters).
pub fn prometheus_handle() -> PrometheusHandle {
    PROMETHEUS
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                describe();
                handle
            }
            Err(e) => {
                warn!(error = %e, "Prometheus recorder not installed, metrics will be empty");
                PrometheusBuilder::new().build_recorder().handle()
            }
        })
        .clone()
}

fn describe() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "HTTP requests by route, method and status");
    describe_counter!(WS_CONNECTIONS_TOTAL, "WebSocket sessions upgraded");
    describe_counter!(
        TOKEN_VALIDATION_FAILURES_TOTAL,
        "Upgrade attempts refused for bad credentials"
    );
    describe_counter!(RATE_LIMITED_TOTAL, "Upgrade attempts refused by admission control");
}

/// Count one HTTP request.
pub fn record_request(route: String, method: String, status: u16) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "path" => route,
        "method" => method,
        "status" => status.to_string()
    )
    .increment(1);
}

/// Count one upgraded session.
pub fn record_upgrade() {
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
}

/// Count one credential rejection.
pub fn record_validation_failure() {
    counter!(TOKEN_VALIDATION_FAILURES_TOTAL).increment(1);
}

/// Count one admission refusal.
pub fn record_rate_limited() {
    counter!(RATE_LIMITED_TOTAL).increment(1);
}
