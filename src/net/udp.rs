//! UDP transport. Every datagram is an independent request; replies go to
//! the sender's address and port.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::net::UdpSocket;

use crate::dispatch::{ConnectionHandle, Pipeline, ReplyError, ReplySink, TransportKind};

#[derive(Debug)]
pub struct UdpReply {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpReply {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }
}

#[async_trait]
impl ReplySink for UdpReply {
    fn transport(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn descriptor(&self) -> Value {
        json!({ "address": self.peer.ip().to_string(), "port": self.peer.port() })
    }

    async fn send(&self, payload: Bytes) -> Result<(), ReplyError> {
        self.socket.send_to(&payload, self.peer).await?;
        Ok(())
    }
}

pub async fn handle_datagram(pipeline: Pipeline, socket: Arc<UdpSocket>, payload: Bytes, peer: SocketAddr) {
    let handle = ConnectionHandle::new(UdpReply::new(socket, peer));
    let outcome = pipeline.handle_payload(payload, &handle).await;
    tracing::trace!(%peer, ?outcome, "Datagram handled");
}
