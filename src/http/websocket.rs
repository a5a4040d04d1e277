//! WebSocket transport.
//!
//! # Responsibilities
//! - Complete the upgrade handshake
//! - Fire connect/open/close callbacks
//! - Feed each message through the shared pipeline
//!
//! # Data Flow
//! ```text
//! Client ──── message ────→ reader → Pipeline::handle_payload
//! Client ←─── message ───── writer ← WsReply (direct replies and task results)
//! ```
//!
//! # Design Decisions
//! - Messages carry their own boundaries; replies are sent unframed
//! - UTF-8 replies go out as text messages, anything else as binary
//! - Ping/pong frames are handled by the protocol layer

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::request::Parts;
use axum::response::Response;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::dispatch::envelope::merge_additive;
use crate::dispatch::{descriptor_params, ConnectionHandle, Params, ReplyError, ReplySink, TransportKind};
use crate::http::request;
use crate::http::server::ConnMeta;
use crate::net::connection::ConnectionId;
use crate::net::ConnectionContext;
use crate::routing::LifecycleEvent;

#[derive(Debug)]
pub struct WsReply {
    conn: ConnectionId,
    tx: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl ReplySink for WsReply {
    fn transport(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn descriptor(&self) -> Value {
        json!(self.conn.as_u64())
    }

    async fn send(&self, payload: Bytes) -> Result<(), ReplyError> {
        self.tx.send(payload).map_err(|_| ReplyError::Closed)
    }
}

/// Accept an upgrade. Handshake query, cookies and headers become the
/// params of the open callback.
pub fn accept(upgrade: WebSocketUpgrade, ctx: ConnectionContext, meta: ConnMeta, parts: &Parts) -> Response {
    let sources = request::extract_sources(parts, &Bytes::new());
    let mut handshake = sources.query;
    merge_additive(&mut handshake, sources.cookies);
    merge_additive(&mut handshake, sources.headers);

    let max = ctx.max_frame_bytes;
    upgrade
        .max_message_size(max)
        .on_upgrade(move |socket| serve_socket(socket, ctx, meta, handshake))
}

fn outgoing(payload: Bytes) -> Message {
    match String::from_utf8(payload.to_vec()) {
        Ok(text) => Message::Text(text.into()),
        Err(_) => Message::Binary(payload),
    }
}

async fn serve_socket(socket: WebSocket, ctx: ConnectionContext, meta: ConnMeta, handshake: Params) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let handle = ConnectionHandle::new(WsReply { conn: meta.id, tx });
    let params = descriptor_params(&handle);

    tracing::debug!(connection_id = %meta.id, peer = %meta.peer, "WebSocket open");

    let writer = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if let Err(e) = sink.send(outgoing(payload)).await {
                tracing::debug!(connection_id = %meta.id, error = %e, "WebSocket write failed");
                return;
            }
        }
        let _ = sink.close().await;
    });

    ctx.hooks.fire(LifecycleEvent::Connect, params.clone()).await;
    let mut open = params.clone();
    merge_additive(&mut open, handshake);
    ctx.hooks.fire(LifecycleEvent::Open, open).await;

    loop {
        let message = tokio::select! {
            _ = ctx.drain.cancelled() => break,
            message = stream.next() => message,
        };
        let payload = match message {
            Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(connection_id = %meta.id, error = %e, "WebSocket read failed");
                break;
            }
        };
        if ctx.pipeline.handle_payload(payload, &handle).await.closes_connection() {
            break;
        }
    }

    drop(handle);
    ctx.hooks.fire(LifecycleEvent::Close, params).await;

    let _ = writer.await;
    tracing::debug!(connection_id = %meta.id, "WebSocket closed");
}
