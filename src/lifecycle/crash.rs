//! Crash-safety net.
//!
//! A panic while a request is being dispatched takes its worker down. Before
//! that happens the boundary answers the request with an error envelope, so
//! the caller does not wait forever, and tells the worker it has crashed.
//! The answer target comes from a context captured when dispatch started,
//! never from shared state.

use std::any::Any;
use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};

use futures_util::FutureExt;
use tokio::sync::mpsc;

use crate::dispatch::envelope::{RequestEnvelope, RequestId};
use crate::dispatch::reply::{self, ConnectionHandle};
use crate::dispatch::response::{ResponseEnvelope, CODE_INTERNAL};

/// What the boundary needs to answer one request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub handle: ConnectionHandle,
    /// The caller is still owed a response.
    pub needs_answer: bool,
}

impl RequestContext {
    pub fn capture(envelope: &RequestEnvelope) -> Self {
        Self {
            request_id: envelope.request_id,
            handle: envelope.handle.clone(),
            needs_answer: envelope.flags.ack_required && !envelope.flags.offload,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrashReport {
    pub request_id: Option<RequestId>,
    pub message: String,
}

/// Tells the owning worker that one of its tasks crashed.
#[derive(Debug, Clone)]
pub struct CrashSignal(mpsc::UnboundedSender<CrashReport>);

pub type CrashReceiver = mpsc::UnboundedReceiver<CrashReport>;

pub fn channel() -> (CrashSignal, CrashReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CrashSignal(tx), rx)
}

impl CrashSignal {
    pub fn raise(&self, report: CrashReport) {
        // The worker may already be gone.
        let _ = self.0.send(report);
    }
}

/// Run `fut`, answering and reporting if it panics.
///
/// The panic is resumed afterwards so the task running the request dies
/// with it.
pub async fn guarded<F>(ctx: RequestContext, signal: &CrashSignal, fut: F) -> F::Output
where
    F: Future,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(output) => output,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(request_id = %ctx.request_id, panic = %message, "Request crashed its worker");

            if ctx.needs_answer {
                let response = ResponseEnvelope::error(CODE_INTERNAL, "internal error");
                reply::deliver(&ctx.handle, &response).await;
            }
            signal.raise(CrashReport {
                request_id: Some(ctx.request_id),
                message,
            });
            resume_unwind(panic)
        }
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
