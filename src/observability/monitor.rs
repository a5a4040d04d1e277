//! Per-route execution timing.
//!
//! # Responsibilities
//! - Define the record emitted after every completed request
//! - Abstract the sink so embedders can forward records elsewhere
//!
//! # Design Decisions
//! - Control commands and dropped requests never produce a record
//! - An offloaded request produces two records: enqueue and task
//! - The default sink logs and feeds the duration histogram

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::dispatch::TransportKind;
use crate::observability::metrics;
use crate::routing::RouteTarget;

/// Which part of a request's life a record measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Routed inline on the accepting worker.
    Request,
    /// Task ID generated, queued and acknowledged.
    Enqueue,
    /// Executed on the task pool.
    Task,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Enqueue => "enqueue",
            Self::Task => "task",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorRecord {
    pub target: RouteTarget,
    pub transport: TransportKind,
    pub phase: Phase,
    pub elapsed: Duration,
    /// Response code of the envelope produced.
    pub code: i64,
}

pub trait MonitorSink: Send + Sync {
    fn record(&self, record: &MonitorRecord);
}

/// Logs each record and feeds the request duration histogram.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSink;

impl MonitorSink for MetricsSink {
    fn record(&self, record: &MonitorRecord) {
        tracing::debug!(
            target_route = %record.target,
            transport = %record.transport,
            phase = %record.phase,
            code = record.code,
            elapsed_ms = record.elapsed.as_secs_f64() * 1000.0,
            "Request completed"
        );
        metrics::record_request_duration(
            &record.target.to_string(),
            record.transport.as_str(),
            record.phase.as_str(),
            record.elapsed,
        );
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<MonitorRecord>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<MonitorRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl MonitorSink for MemorySink {
    fn record(&self, record: &MonitorRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
    }
}

/// Cheaply cloneable handle to the configured sink.
#[derive(Clone)]
pub struct Monitor(Arc<dyn MonitorSink>);

impl Monitor {
    pub fn new(sink: Arc<dyn MonitorSink>) -> Self {
        Self(sink)
    }

    pub fn record(&self, record: MonitorRecord) {
        self.0.record(&record);
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new(Arc::new(MetricsSink))
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Monitor")
    }
}
