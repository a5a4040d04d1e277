//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! RequestEnvelope (params, HTTP path)
//!     → router.rs (resolve controller/method)
//!     → Handler::call
//!     → ResponseEnvelope (success or converted error)
//!
//! Lifecycle callbacks (at startup):
//!     CallbackConfig
//!     → hooks.rs (parse targets, check registration)
//!     → Freeze as immutable LifecycleHooks table
//! ```
//!
//! # Design Decisions
//! - Handlers are the embedding program's business; the gateway only owns
//!   the table and the error conversion
//! - Route table is immutable at runtime
//! - Configured targets are validated before any worker starts

pub mod hooks;
pub mod router;

pub use hooks::{HookError, LifecycleEvent, LifecycleHooks};
pub use router::{
    CallSource, FnHandler, Handler, HandlerError, HandlerResult, RouteCall, RouteKeys,
    RouteTarget, RouteTargetError, Router,
};
