//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define gateway metrics (latency, drops, control commands, tasks)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `gateway_request_duration_seconds` (histogram): by target, transport, phase
//! - `gateway_requests_dropped_total` (counter): stale requests by transport
//! - `gateway_control_commands_total` (counter): ping/reload by transport
//! - `gateway_task_state_total` (counter): task state transitions
//! - `gateway_task_queue_wait_seconds` (histogram): time tasks spend queued
//! - `gateway_worker_crashes_total` (counter): crashed workers by index
//! - `gateway_active_connections` (gauge): open stream connections by worker
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so tests and
//!   embedders pay nothing
//! - Labels stay low-cardinality: route targets come from the route table

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request_duration(target: &str, transport: &'static str, phase: &'static str, elapsed: Duration) {
    histogram!(
        "gateway_request_duration_seconds",
        "target" => target.to_string(),
        "transport" => transport,
        "phase" => phase
    )
    .record(elapsed.as_secs_f64());
}

pub fn record_dropped(transport: &'static str) {
    counter!("gateway_requests_dropped_total", "transport" => transport).increment(1);
}

pub fn record_control(command: &'static str, transport: &'static str) {
    counter!("gateway_control_commands_total", "command" => command, "transport" => transport).increment(1);
}

pub fn record_task_state(state: &'static str) {
    counter!("gateway_task_state_total", "state" => state).increment(1);
}

pub fn record_task_wait(waited: Duration) {
    histogram!("gateway_task_queue_wait_seconds").record(waited.as_secs_f64());
}

pub fn record_worker_crash(worker_id: usize) {
    counter!("gateway_worker_crashes_total", "worker" => worker_id.to_string()).increment(1);
}

pub fn set_active_connections(worker_id: usize, count: u64) {
    gauge!("gateway_active_connections", "worker" => worker_id.to_string()).set(count as f64);
}
