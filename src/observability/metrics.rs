//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): handled requests by status
//! - `gateway_authn_denied_total` (counter): authentication rejections by reason
//! - `gateway_authz_denied_total` (counter): authorization rejections
//! - `gateway_policy_reload_total` (counter): policy reloads by result
//! - `gateway_panics_total` (counter): recovered handler panics
//! - `gateway_active_connections` (gauge): open client connections
//!
//! # Design Decisions
//! - The Prometheus recorder is installed once per process; the rendered
//!   text is exposed through the `/debug/vars` endpoint
//! - Recording before installation is a no-op

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Later calls return the same handle.
pub fn install() -> Result<PrometheusHandle, String> {
    if let Some(handle) = HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| e.to_string())?;
    Ok(HANDLE.get_or_init(|| handle).clone())
}

/// Render the current metrics in Prometheus text format.
pub fn render() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

pub fn record_request(status: u16) {
    metrics::counter!("gateway_requests_total", "status" => status.to_string()).increment(1);
}

pub fn record_authn_denied(reason: &'static str) {
    metrics::counter!("gateway_authn_denied_total", "reason" => reason).increment(1);
}

pub fn record_authz_denied() {
    metrics::counter!("gateway_authz_denied_total").increment(1);
}

pub fn record_policy_reload(result: &'static str) {
    metrics::counter!("gateway_policy_reload_total", "result" => result).increment(1);
}

pub fn record_panic() {
    metrics::counter!("gateway_panics_total").increment(1);
}

pub fn set_active_connections(server: &str, count: u64) {
    metrics::gauge!("gateway_active_connections", "server" => server.to_string()).set(count as f64);
}
