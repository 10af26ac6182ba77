//! Metrics collection and exposition.
//!
//! # Metrics
//! - `hc_credential_acquired_total` (counter)
//! - `hc_credential_acquire_timeouts_total` (counter)
//! - `hc_credential_released_total` (counter)
//! - `hc_credential_wait_seconds` (histogram): time spent in acquire
//! - `hc_pool_used_capacity`, `hc_pool_available_capacity` (gauges)
//! - `hc_proxy_outcomes_total` (counter): by proxy, outcome
//! - `hc_checks_completed_total` (counter): by result
//! - `hc_active_checks` (gauge)

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::pool::PoolStatus;

/// Install the Prometheus recorder and its HTTP listener.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Prometheus exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install Prometheus exporter"),
    }
}

pub fn record_credential_acquired(waited: Duration) {
    counter!("hc_credential_acquired_total").increment(1);
    histogram!("hc_credential_wait_seconds").record(waited.as_secs_f64());
}

pub fn record_acquire_timeout() {
    counter!("hc_credential_acquire_timeouts_total").increment(1);
}

pub fn record_credential_released() {
    counter!("hc_credential_released_total").increment(1);
}

pub fn record_pool_status(status: &PoolStatus) {
    gauge!("hc_pool_used_capacity").set(status.used_capacity as f64);
    gauge!("hc_pool_available_capacity").set(status.available_capacity as f64);
}

pub fn record_proxy_outcome(proxy: &str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!("hc_proxy_outcomes_total", "proxy" => proxy.to_string(), "outcome" => outcome)
        .increment(1);
}

pub fn record_check_completed(result: &'static str) {
    counter!("hc_checks_completed_total", "result" => result).increment(1);
}

pub fn record_active_checks(count: u64) {
    gauge!("hc_active_checks").set(count as f64);
}
