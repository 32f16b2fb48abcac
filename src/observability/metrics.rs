//! Metrics collection and exposition.
//!
//! # Metrics
//! - `pipetap_messages_total` (counter): messages seen by a transform, by direction
//! - `pipetap_messages_dropped_total` (counter): messages a transform suppressed
//! - `pipetap_handler_faults_total` (counter): transform errors, by direction
//! - `pipetap_stage_installs_total` (counter): connections intercepted
//! - `pipetap_active` (gauge): 1 while interception is active

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::intercept::Direction;

/// Install the Prometheus recorder and its scrape endpoint.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_message(direction: Direction) {
    metrics::counter!("pipetap_messages_total", "direction" => direction.as_str()).increment(1);
}

pub fn record_drop(direction: Direction) {
    metrics::counter!("pipetap_messages_dropped_total", "direction" => direction.as_str())
        .increment(1);
}

pub fn record_fault(direction: Direction) {
    metrics::counter!("pipetap_handler_faults_total", "direction" => direction.as_str())
        .increment(1);
}

pub fn record_install() {
    metrics::counter!("pipetap_stage_installs_total").increment(1);
}

pub fn record_active(active: bool) {
    metrics::gauge!("pipetap_active").set(if active { 1.0 } else { 0.0 });
}
