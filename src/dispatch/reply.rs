//! Per-transport reply path.
//!
//! Every transport implements [`ReplySink`]; the rest of the pipeline only
//! ever sees a [`ConnectionHandle`]. TCP sinks frame, WebSocket sinks send a
//! message, UDP sinks `send_to` the original peer and HTTP sinks complete the
//! pending response exactly once.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use crate::dispatch::envelope::TransportKind;
use crate::dispatch::response::ResponseEnvelope;

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("connection is closed")]
    Closed,

    #[error("a response was already sent on this handle")]
    AlreadySent,

    #[error("reply I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sends bytes back to whoever sent the request.
#[async_trait]
pub trait ReplySink: Send + Sync + fmt::Debug {
    fn transport(&self) -> TransportKind;

    /// Value exposed to handlers as `_fd`.
    fn descriptor(&self) -> Value;

    async fn send(&self, payload: Bytes) -> Result<(), ReplyError>;
}

/// Shared reply address of one request.
#[derive(Clone, Debug)]
pub struct ConnectionHandle(Arc<dyn ReplySink>);

impl ConnectionHandle {
    pub fn new(sink: impl ReplySink + 'static) -> Self {
        Self(Arc::new(sink))
    }

    pub fn from_arc(sink: Arc<dyn ReplySink>) -> Self {
        Self(sink)
    }

    pub fn transport(&self) -> TransportKind {
        self.0.transport()
    }

    pub fn descriptor(&self) -> Value {
        self.0.descriptor()
    }

    pub async fn send(&self, payload: Bytes) -> Result<(), ReplyError> {
        self.0.send(payload).await
    }
}

/// Send the empty success envelope.
pub async fn acknowledge(handle: &ConnectionHandle) -> Result<(), ReplyError> {
    respond(handle, &ResponseEnvelope::empty()).await
}

pub async fn respond(handle: &ConnectionHandle, response: &ResponseEnvelope) -> Result<(), ReplyError> {
    handle.send(response.to_bytes()).await
}

/// Best-effort send used when the caller may be gone.
///
/// Returns whether the bytes were handed to the transport.
pub async fn deliver(handle: &ConnectionHandle, response: &ResponseEnvelope) -> bool {
    match respond(handle, response).await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(
                transport = %handle.transport(),
                descriptor = %handle.descriptor(),
                error = %e,
                "Dropping undeliverable response"
            );
            false
        }
    }
}

/// A sink that records every write instead of sending it.
///
/// Used to observe the pipeline without a socket.
#[derive(Debug)]
pub struct RecordingReply {
    transport: TransportKind,
    descriptor: Value,
    sent: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
}

impl RecordingReply {
    pub fn new(transport: TransportKind, descriptor: Value) -> Arc<Self> {
        Arc::new(Self {
            transport,
            descriptor,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// A recorder together with a handle writing into it.
    pub fn handle(transport: TransportKind, descriptor: Value) -> (ConnectionHandle, Arc<Self>) {
        let reply = Self::new(transport, descriptor);
        (ConnectionHandle::from_arc(reply.clone()), reply)
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Decode every recorded write as a response envelope.
    pub fn responses(&self) -> Vec<ResponseEnvelope> {
        self.sent()
            .iter()
            .filter_map(|bytes| serde_json::from_slice(bytes).ok())
            .collect()
    }

    /// Make further sends fail as if the peer went away.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReplySink for RecordingReply {
    fn transport(&self) -> TransportKind {
        self.transport
    }

    fn descriptor(&self) -> Value {
        self.descriptor.clone()
    }

    async fn send(&self, payload: Bytes) -> Result<(), ReplyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReplyError::Closed);
        }
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn deliver_is_best_effort() {
        let (handle, reply) = RecordingReply::handle(TransportKind::Udp, json!({"address": "127.0.0.1", "port": 9}));
        assert!(deliver(&handle, &ResponseEnvelope::success(json!(1))).await);

        reply.close();
        assert!(!deliver(&handle, &ResponseEnvelope::success(json!(2))).await);
        assert_eq!(reply.responses(), vec![ResponseEnvelope::success(json!(1))]);
    }
}
