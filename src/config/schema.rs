//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dispatch::TransportKind;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// Server kind and worker pool sizing.
    pub server: ServerConfig,

    /// Request normalization and staleness settings.
    pub requests: RequestConfig,

    /// Route targets fired on connection lifecycle events.
    pub callbacks: CallbackConfig,

    /// Periodic timers, registered by worker 0 only.
    pub timers: Vec<TimerConfig>,

    /// Shared resources owned by the last worker.
    pub resources: ResourceConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:9501").
    pub bind_address: String,

    /// Maximum concurrent stream connections (backpressure). Ignored for UDP.
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9501".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Server kind and worker pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Transport served by this gateway.
    pub kind: TransportKind,

    /// Number of accepting workers. The last one owns shared resources.
    pub worker_count: usize,

    /// Number of background task workers.
    pub task_worker_count: usize,

    /// Capacity of the offload queue before submissions are rejected.
    pub task_queue_capacity: usize,

    /// How long a stopping worker waits for in-flight connections, in seconds.
    pub drain_timeout_secs: u64,

    /// Largest accepted TCP frame payload in bytes.
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Tcp,
            worker_count: 4,
            task_worker_count: 2,
            task_queue_capacity: 1024,
            drain_timeout_secs: 10,
            max_frame_bytes: 2 * 1024 * 1024, // 2MB
        }
    }
}

/// Request normalization settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Maximum request age in milliseconds. 0 disables the timeout guard.
    pub max_age_ms: u64,

    /// Param naming the controller.
    pub controller_key: String,

    /// Param naming the method.
    pub method_key: String,

    /// Target used when neither params nor path name one.
    pub default_target: String,

    /// Param carrying the acknowledgement flag.
    pub ack_key: String,

    /// Param carrying the offload flag.
    pub offload_key: String,

    /// Param carrying the caller's creation time (ms since epoch).
    pub timestamp_key: String,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 0,
            controller_key: "a".to_string(),
            method_key: "m".to_string(),
            default_target: "main/main".to_string(),
            ack_key: "_recv".to_string(),
            offload_key: "_task".to_string(),
            timestamp_key: "_timestamp".to_string(),
        }
    }
}

/// Lifecycle callbacks, each a `"controller/method"` route target.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct CallbackConfig {
    /// Fired after a WebSocket handshake.
    pub on_open: Option<String>,

    /// Fired when a TCP or WebSocket connection is accepted.
    pub on_connect: Option<String>,

    /// Fired when a TCP or WebSocket connection closes.
    pub on_close: Option<String>,
}

/// A periodic timer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimerConfig {
    /// Tick interval in milliseconds.
    pub interval_ms: u64,

    /// Route target invoked on every tick.
    pub callback: String,

    /// Params passed to the callback.
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Shared resource configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ResourceConfig {
    /// File the shared cache is loaded from and flushed to.
    pub cache_path: Option<String>,
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// HTTP request timeout (total time to produce a response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of the human-readable format.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
