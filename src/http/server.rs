//! HTTP server setup and per-connection serving.
//!
//! # Responsibilities
//! - Create Axum Router with the dispatch handler
//! - Wire up middleware (tracing, timeout, request ID)
//! - Serve connections accepted by a worker, with graceful drain
//! - Answer the `/ant-ping` and `/favicon.ico` sentinels
//! - Hand WebSocket upgrades to the websocket module
//!
//! # Design Decisions
//! - Connections are accepted by workers, not by `axum::serve`, so each
//!   HTTP connection belongs to a worker like a TCP connection does
//! - Dispatch runs in a task owned by the connection; the handler only
//!   waits for the first reply, so an acknowledged request keeps routing
//!   after the response. Closing the connection waits for those tasks,
//!   aborting the connection cancels them

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request, State, WebSocketUpgrade},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Extension, Router,
};
use bytes::Bytes;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
    service::TowerToHyperService,
};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::dispatch::{ConnectionHandle, ReplyError, ReplySink, TransportKind};
use crate::http::{request, response, websocket};
use crate::net::connection::{ConnectionGuard, ConnectionId};
use crate::net::control::{ControlCommand, HttpSentinel};
use crate::net::listener::ConnectionPermit;
use crate::net::ConnectionContext;
use crate::observability::metrics;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct HttpState {
    pub conn: ConnectionContext,
    /// Accept WebSocket upgrades.
    pub websocket: bool,
}

/// Identity of the connection a request arrived on.
#[derive(Debug, Clone, Copy)]
pub struct ConnMeta {
    pub id: ConnectionId,
    pub peer: SocketAddr,
}

/// Dispatch tasks started by one HTTP connection. Dropping the last clone
/// aborts whatever is still running.
#[derive(Clone, Default)]
pub struct ConnTasks(Arc<Mutex<JoinSet<()>>>);

impl ConnTasks {
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self.0.lock().unwrap_or_else(|e| e.into_inner());
        while set.try_join_next().is_some() {}
        set.spawn(task);
    }

    /// Wait for every task started so far.
    pub async fn finish(&self) {
        let mut set = std::mem::take(&mut *self.0.lock().unwrap_or_else(|e| e.into_inner()));
        while set.join_next().await.is_some() {}
    }
}

/// Completes the pending HTTP response. Usable once.
#[derive(Debug)]
pub struct HttpReply {
    conn: ConnectionId,
    tx: Mutex<Option<oneshot::Sender<Bytes>>>,
}

impl HttpReply {
    pub fn new(conn: ConnectionId) -> (Self, oneshot::Receiver<Bytes>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                conn,
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

#[async_trait]
impl ReplySink for HttpReply {
    fn transport(&self) -> TransportKind {
        TransportKind::Http
    }

    fn descriptor(&self) -> Value {
        json!(self.conn.as_u64())
    }

    async fn send(&self, payload: Bytes) -> Result<(), ReplyError> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(ReplyError::AlreadySent)?;
        tx.send(payload).map_err(|_| ReplyError::Closed)
    }
}

/// Build the Axum router with all middleware layers.
#[allow(deprecated)]
pub fn build_router(state: HttpState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/", any(serve_request))
        .route("/{*path}", any(serve_request))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TimeoutLayer::new(request_timeout)),
        )
}

/// Serve one accepted connection until it closes or the worker drains.
pub async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    guard: ConnectionGuard,
    _permit: ConnectionPermit,
    app: Router,
    ctx: ConnectionContext,
) {
    let meta = ConnMeta { id: guard.id(), peer };
    let tasks = ConnTasks::default();
    let service = TowerToHyperService::new(app.layer(Extension(meta)).layer(Extension(tasks.clone())));
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
    let mut conn = std::pin::pin!(conn);

    let mut draining = false;
    let result = loop {
        tokio::select! {
            result = conn.as_mut() => break result,
            _ = ctx.drain.cancelled(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    };

    if let Err(e) = result {
        tracing::debug!(connection_id = %meta.id, %peer, error = %e, "HTTP connection ended with error");
    }
    tasks.finish().await;
}

/// Main dispatch handler.
async fn serve_request(
    State(state): State<HttpState>,
    Extension(meta): Extension<ConnMeta>,
    Extension(tasks): Extension<ConnTasks>,
    request: Request,
) -> Response {
    if let Some(sentinel) = HttpSentinel::classify(request.uri().path()) {
        if sentinel == HttpSentinel::Ping {
            metrics::record_control(ControlCommand::Ping.name(), TransportKind::Http.as_str());
        }
        return response::sentinel(sentinel);
    }

    let (mut parts, body) = request.into_parts();
    if state.websocket && is_upgrade(&parts) {
        return match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(upgrade) => websocket::accept(upgrade, state.conn, meta, &parts),
            Err(rejection) => rejection.into_response(),
        };
    }

    let body = match axum::body::to_bytes(body, state.conn.max_frame_bytes).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(connection_id = %meta.id, error = %e, "Rejecting request body");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let sources = request::extract_sources(&parts, &body);
    let (reply, answer) = HttpReply::new(meta.id);
    let pipeline = state.conn.pipeline.clone();
    let envelope = pipeline.builder().from_http(sources, ConnectionHandle::new(reply));
    tasks.spawn(async move {
        pipeline.dispatch(envelope).await;
    });

    match answer.await {
        Ok(body) => response::envelope(body),
        Err(_) => response::unanswered(),
    }
}

fn is_upgrade(parts: &Parts) -> bool {
    parts
        .headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reply_is_single_use() {
        let (reply, rx) = HttpReply::new(ConnectionId::new());
        reply.send(Bytes::from_static(b"first")).await.unwrap();
        assert!(matches!(
            reply.send(Bytes::from_static(b"second")).await,
            Err(ReplyError::AlreadySent)
        ));
        assert_eq!(rx.await.unwrap(), Bytes::from_static(b"first"));
    }

    #[tokio::test]
    async fn connection_tasks_finish_and_abort_with_the_connection() {
        let tasks = ConnTasks::default();
        let (done_tx, done_rx) = oneshot::channel();
        tasks.spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = done_tx.send(());
        });
        tasks.finish().await;
        assert!(done_rx.await.is_ok());

        let tasks = ConnTasks::default();
        let (held_tx, held_rx) = oneshot::channel::<()>();
        tasks.spawn(async move {
            let _held = held_tx;
            std::future::pending::<()>().await;
        });
        drop(tasks);
        assert!(held_rx.await.is_err());
    }

    #[tokio::test]
    async fn dropped_reply_closes_the_answer() {
        let (reply, rx) = HttpReply::new(ConnectionId::new());
        drop(reply);
        assert!(rx.await.is_err());
    }
}
