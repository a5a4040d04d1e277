//! Request dispatch subsystem.
//!
//! # Data Flow
//! ```text
//! Transport adapter (net::tcp, net::udp, http)
//!     → envelope.rs (normalize params, flags, handle)
//!     → guard.rs (drop stale requests)
//!     → pipeline.rs (route now, ack-and-discard, or offload)
//!     → task.rs (background pool for offloaded requests)
//!     → reply.rs (per-transport send)
//!     → response.rs ({code, msg, data})
//! ```
//!
//! # Design Decisions
//! - One pipeline for every transport; adapters only build handles
//! - A connection handle is the only way back to the caller
//! - Task results travel with the full origin envelope

pub mod envelope;
pub mod guard;
pub mod pipeline;
pub mod reply;
pub mod response;
pub mod task;

pub use envelope::{
    descriptor_params, EnvelopeBuilder, EnvelopeError, Flags, HttpSources, JsonPayloadParser, Params, PayloadParser,
    RequestEnvelope, RequestId, TransportKind,
};
pub use guard::TimeoutGuard;
pub use pipeline::{DispatchContext, Outcome, Pipeline};
pub use reply::{ConnectionHandle, RecordingReply, ReplyError, ReplySink};
pub use response::ResponseEnvelope;
pub use task::{SubmitError, TaskId, TaskPool, TaskQueue, TaskState};
