//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming connection or datagram
//!     → listener.rs (shared bind, connection limits)
//!     → connection.rs (connection IDs, per-worker tracking)
//!     → tcp.rs   frame.rs decode → control.rs → pipeline
//!     → udp.rs   raw datagram    → control.rs → pipeline
//!     → http     (HTTP and WebSocket, see crate::http)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection belongs to the worker that accepted it
//! - Partial frames are buffered by the codec, never surfaced

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::dispatch::Pipeline;
use crate::routing::LifecycleHooks;

pub mod connection;
pub mod control;
pub mod frame;
pub mod listener;
pub mod tcp;
pub mod udp;

pub use listener::{BoundTransport, Inbound, Listener, ListenerError};

/// What a connection task needs from its worker.
#[derive(Clone)]
pub struct ConnectionContext {
    pub pipeline: Pipeline,
    pub hooks: Arc<LifecycleHooks>,
    /// Cancelled when the worker stops accepting.
    pub drain: CancellationToken,
    pub max_frame_bytes: usize,
}
