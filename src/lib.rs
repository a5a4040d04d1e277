//! Multi-transport request gateway library.
//!
//! Workers accept TCP, UDP, HTTP or WebSocket traffic on one shared
//! listener, normalize each message into a request envelope and route it
//! to a registered handler. Long-running work can be offloaded to a
//! background task pool.

pub mod config;
pub mod dispatch;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod routing;

pub use config::GatewayConfig;
pub use dispatch::{ResponseEnvelope, TransportKind};
pub use lifecycle::{Gateway, GatewayBuilder, Shutdown};
pub use routing::{HandlerError, HandlerResult, RouteCall, RouteTarget, Router};
