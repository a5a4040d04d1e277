//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → handed to the supervisor, which builds workers from it
//!
//! On reload (ant-reload, SIGHUP, or file change):
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → supervisor drains the current workers
//!     → new worker generation starts with the new config
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a worker reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    CallbackConfig, GatewayConfig, ListenerConfig, ObservabilityConfig, RequestConfig,
    ResourceConfig, ServerConfig, TimeoutConfig, TimerConfig,
};
pub use validation::{validate_config, ValidationError};
