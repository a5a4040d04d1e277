//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validate config → Bind listener → Start task pool → Supervisor
//!
//! Supervision (supervisor.rs, worker.rs):
//!     Generation of N workers → accept, serve, crash → respawn
//!     Reload request → drain generation → rebuild → next generation
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain connections → Flush → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!     SIGHUP → Trigger reload
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then workers
//! - Ordered shutdown: stop accept, drain, flush, stop task pool
//! - Shutdown has timeout: remaining connections are aborted after it

pub mod crash;
pub mod resources;
pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod supervisor;
pub mod timers;
pub mod worker;

pub use resources::{FileCache, ResourceError, SharedResource, SharedResources};
pub use shutdown::Shutdown;
pub use signals::{ReloadCause, ReloadHandle};
pub use startup::{Gateway, GatewayBuilder, StartupError};
pub use worker::{WorkerDescriptor, WorkerExit, WorkerState};
