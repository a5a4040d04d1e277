//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Dispatch pipeline and task pool produce:
//!     → monitor.rs (per-route timing records)
//!     → MonitorSink (metrics histogram by default)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows through all subsystems
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
pub mod monitor;

pub use monitor::{MemorySink, MetricsSink, Monitor, MonitorRecord, MonitorSink, Phase};
