//! Raw TCP transport.
//!
//! Each connection gets a framed reader loop and a writer task fed through
//! a channel, so offloaded tasks can reply on the connection after the
//! message that created them has been handled.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::dispatch::{descriptor_params, ConnectionHandle, ReplyError, ReplySink, TransportKind};
use crate::net::connection::{ConnectionGuard, ConnectionId};
use crate::net::frame::FrameCodec;
use crate::net::listener::ConnectionPermit;
use crate::net::ConnectionContext;
use crate::routing::LifecycleEvent;

/// Reply path of one TCP connection; frames are added by the writer.
#[derive(Debug)]
pub struct TcpReply {
    conn: ConnectionId,
    tx: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl ReplySink for TcpReply {
    fn transport(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn descriptor(&self) -> Value {
        json!(self.conn.as_u64())
    }

    async fn send(&self, payload: Bytes) -> Result<(), ReplyError> {
        self.tx.send(payload).map_err(|_| ReplyError::Closed)
    }
}

/// Serve one accepted TCP connection until the peer leaves, a reload is
/// requested on it, or the worker drains.
pub async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    guard: ConnectionGuard,
    _permit: ConnectionPermit,
    ctx: ConnectionContext,
) {
    let conn = guard.id();
    let (read_half, write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, FrameCodec::new(ctx.max_frame_bytes));
    let mut sink = FramedWrite::new(write_half, FrameCodec::new(ctx.max_frame_bytes));

    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let handle = ConnectionHandle::new(TcpReply { conn, tx });
    let params = descriptor_params(&handle);

    tracing::debug!(connection_id = %conn, %peer, "TCP connection open");

    // Own task, so a crash answer queued by a panicking reader still goes out.
    let writer = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if let Err(e) = sink.send(payload).await {
                tracing::debug!(connection_id = %conn, error = %e, "TCP write failed");
                return;
            }
        }
        let _ = sink.close().await;
    });

    ctx.hooks.fire(LifecycleEvent::Connect, params.clone()).await;

    loop {
        let frame = tokio::select! {
            _ = ctx.drain.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(payload)) => {
                let outcome = ctx.pipeline.handle_payload(payload, &handle).await;
                if outcome.closes_connection() {
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(connection_id = %conn, %peer, error = %e, "Closing connection on frame error");
                break;
            }
            None => break,
        }
    }

    // Pending task results keep the writer alive through their own clones.
    drop(handle);
    ctx.hooks.fire(LifecycleEvent::Close, params).await;

    let _ = writer.await;
    tracing::debug!(connection_id = %conn, %peer, "TCP connection closed");
}
