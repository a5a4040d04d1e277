//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ant_gateway::config::GatewayConfig;
use ant_gateway::dispatch::{ResponseEnvelope, TransportKind};
use ant_gateway::lifecycle::{
    GatewayBuilder, ReloadHandle, ResourceError, SharedResource, Shutdown, StartupError,
};
use ant_gateway::net::frame::FrameCodec;
use ant_gateway::routing::{HandlerResult, RouteCall, RouteTarget, Router};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

pub const REPLY_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a test waits to be sure nothing else arrives.
pub const SILENCE: Duration = Duration::from_millis(400);

/// A gateway running on an ephemeral port.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub shutdown: Arc<Shutdown>,
    pub reload: ReloadHandle,
    handle: JoinHandle<Result<(), StartupError>>,
}

impl TestGateway {
    pub async fn start(builder: GatewayBuilder) -> Self {
        let gateway = builder.bind().await.expect("gateway binds");
        let addr = gateway.local_addr();
        let shutdown = gateway.shutdown_handle();
        let reload = gateway.reload_handle();
        let handle = tokio::spawn(gateway.run());
        // Let the supervisor subscribe and the workers come up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        Self {
            addr,
            shutdown,
            reload,
            handle,
        }
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("gateway stops in time")
            .expect("gateway task")
            .expect("gateway run");
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

pub fn config(kind: TransportKind) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.listener.max_connections = 64;
    config.server.kind = kind;
    config.server.worker_count = 2;
    config.server.drain_timeout_secs = 1;
    config
}

/// Routes used across the suite:
/// - `main/main` echoes its params
/// - `job/slow` sleeps 300ms, then returns `{"done": true}`
/// - `crash/now` panics
pub fn router() -> Router {
    Router::new()
        .route(RouteTarget::new("main", "main"), echo)
        .route(RouteTarget::new("job", "slow"), slow)
        .route(RouteTarget::new("crash", "now"), crash)
}

async fn echo(call: RouteCall) -> HandlerResult {
    Ok(Value::Object(call.params))
}

async fn slow(_call: RouteCall) -> HandlerResult {
    tokio::time::sleep(Duration::from_millis(300)).await;
    Ok(json!({ "done": true }))
}

async fn crash(_call: RouteCall) -> HandlerResult {
    panic!("requested crash");
}

pub fn envelope(bytes: &[u8]) -> ResponseEnvelope {
    serde_json::from_slice(bytes).expect("reply is an envelope")
}

pub fn payload(value: Value) -> Bytes {
    Bytes::from(serde_json::to_vec(&value).expect("serializable"))
}

/// Length-prefixed TCP client.
pub struct FramedClient {
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
}

impl FramedClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FramedRead::new(read_half, FrameCodec::default()),
            writer: FramedWrite::new(write_half, FrameCodec::default()),
        }
    }

    pub async fn send(&mut self, payload: impl Into<Bytes>) {
        self.writer.send(payload.into()).await.expect("send frame");
    }

    pub async fn send_json(&mut self, value: Value) {
        self.send(payload(value)).await;
    }

    /// Next frame, or `None` if the gateway closed the connection.
    pub async fn recv(&mut self) -> Option<Bytes> {
        tokio::time::timeout(REPLY_TIMEOUT, self.reader.next())
            .await
            .expect("reply within timeout")
            .map(|frame| frame.expect("valid frame"))
    }

    pub async fn recv_envelope(&mut self) -> ResponseEnvelope {
        envelope(&self.recv().await.expect("connection open"))
    }

    /// True if nothing arrives for [`SILENCE`].
    pub async fn stays_silent(&mut self) -> bool {
        tokio::time::timeout(SILENCE, self.reader.next()).await.is_err()
    }
}

/// Counts owner loads and flushes.
#[derive(Default)]
pub struct CountingResource {
    pub loads: AtomicUsize,
    pub flushes: AtomicUsize,
}

impl CountingResource {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SharedResource for CountingResource {
    fn name(&self) -> &str {
        "counting"
    }

    async fn load(&self) -> Result<(), ResourceError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn flush(&self) -> Result<(), ResourceError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..150 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
