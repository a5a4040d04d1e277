//! HTTP and WebSocket transports.
//!
//! # Data Flow
//! ```text
//! Connection accepted by a worker
//!     → server.rs (hyper auto connection, Axum router, middleware)
//!     → sentinel paths answered directly
//!     → websocket.rs (upgrade, message loop) when serving WebSocket
//!     → request.rs (query/body/cookie/header sources)
//!     → Pipeline::dispatch
//!     → response.rs (envelope body or 499)
//! ```

pub mod request;
pub mod response;
pub mod server;
pub mod websocket;

pub use server::{build_router, serve_connection, ConnMeta, HttpReply, HttpState};
