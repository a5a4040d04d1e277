//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (worker counts, intervals, capacities)
//! - Check that callback and timer targets are well-formed
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Whether a target is actually registered is checked when the gateway is
//!   built, since the route table is code, not config

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::GatewayConfig;
use crate::routing::RouteTarget;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    InvalidBindAddress(String),
    ZeroWorkers,
    ZeroTaskWorkers,
    ZeroTaskQueue,
    ZeroFrameLimit,
    TooFewConnections { max_connections: usize, worker_count: usize },
    InvalidTarget { field: String, value: String },
    ZeroTimerInterval { index: usize },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBindAddress(addr) => write!(f, "invalid bind address '{addr}'"),
            Self::ZeroWorkers => write!(f, "server.worker_count must be at least 1"),
            Self::ZeroTaskWorkers => write!(f, "server.task_worker_count must be at least 1"),
            Self::ZeroTaskQueue => write!(f, "server.task_queue_capacity must be at least 1"),
            Self::ZeroFrameLimit => write!(f, "server.max_frame_bytes must be at least 1"),
            Self::TooFewConnections {
                max_connections,
                worker_count,
            } => write!(
                f,
                "listener.max_connections ({max_connections}) must be >= server.worker_count ({worker_count})"
            ),
            Self::InvalidTarget { field, value } => {
                write!(f, "{field} = '{value}' is not a controller/method target")
            }
            Self::ZeroTimerInterval { index } => {
                write!(f, "timers[{index}].interval_ms must be greater than 0")
            }
        }
    }
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(
            config.listener.bind_address.clone(),
        ));
    }

    let server = &config.server;
    if server.worker_count == 0 {
        errors.push(ValidationError::ZeroWorkers);
    }
    if server.task_worker_count == 0 {
        errors.push(ValidationError::ZeroTaskWorkers);
    }
    if server.task_queue_capacity == 0 {
        errors.push(ValidationError::ZeroTaskQueue);
    }
    if server.max_frame_bytes == 0 {
        errors.push(ValidationError::ZeroFrameLimit);
    }
    if config.listener.max_connections < server.worker_count {
        errors.push(ValidationError::TooFewConnections {
            max_connections: config.listener.max_connections,
            worker_count: server.worker_count,
        });
    }

    let mut check_target = |field: String, value: &str| {
        if value.parse::<RouteTarget>().is_err() {
            errors.push(ValidationError::InvalidTarget {
                field,
                value: value.to_string(),
            });
        }
    };

    check_target("requests.default_target".into(), &config.requests.default_target);
    let callbacks = [
        ("callbacks.on_open", &config.callbacks.on_open),
        ("callbacks.on_connect", &config.callbacks.on_connect),
        ("callbacks.on_close", &config.callbacks.on_close),
    ];
    for (field, value) in callbacks {
        if let Some(value) = value {
            check_target(field.into(), value);
        }
    }
    for (index, timer) in config.timers.iter().enumerate() {
        check_target(format!("timers[{index}].callback"), &timer.callback);
    }

    for (index, timer) in config.timers.iter().enumerate() {
        if timer.interval_ms == 0 {
            errors.push(ValidationError::ZeroTimerInterval { index });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
