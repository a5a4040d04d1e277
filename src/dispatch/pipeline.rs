//! The request pipeline shared by all transports.
//!
//! # Data Flow
//! ```text
//! raw payload (TCP frame, UDP datagram, WebSocket message)
//!     → ControlCommand::classify (ping / reload short-circuit)
//!     → EnvelopeBuilder::from_payload          HTTP enters here with
//!     → crash::guarded ─────────────────────── EnvelopeBuilder::from_http
//!         → TimeoutGuard (stale: drop)
//!         → offload: reserve slot, ack {taskId}, enqueue
//!         → ack suppressed: empty ack, route, discard result
//!         → otherwise: route, respond
//!     → Monitor
//! ```

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::config::RequestConfig;
use crate::dispatch::envelope::{EnvelopeBuilder, RequestEnvelope};
use crate::dispatch::guard::TimeoutGuard;
use crate::dispatch::reply::{self, ConnectionHandle};
use crate::dispatch::response::{ResponseEnvelope, CODE_BAD_REQUEST, CODE_UNAVAILABLE};
use crate::dispatch::task::{TaskDescriptor, TaskId, TaskQueue};
use crate::lifecycle::crash::{self, CrashSignal, RequestContext};
use crate::lifecycle::signals::{ReloadCause, ReloadHandle};
use crate::lifecycle::worker::WorkerDescriptor;
use crate::net::control::{ControlCommand, PONG, RELOAD_ACK};
use crate::observability::metrics;
use crate::observability::monitor::{Monitor, MonitorRecord, Phase};
use crate::routing::{RouteKeys, RouteTarget, RouteTargetError, Router};

/// Everything a worker needs to dispatch requests.
///
/// Built once per configuration generation and shared by its workers.
pub struct DispatchContext {
    pub router: Arc<Router>,
    pub keys: RouteKeys,
    pub builder: EnvelopeBuilder,
    pub guard: TimeoutGuard,
    pub tasks: TaskQueue,
    pub monitor: Monitor,
    pub reload: ReloadHandle,
}

impl DispatchContext {
    pub fn from_config(
        config: &RequestConfig,
        router: Arc<Router>,
        tasks: TaskQueue,
        monitor: Monitor,
        reload: ReloadHandle,
    ) -> Result<Self, RouteTargetError> {
        Ok(Self {
            router,
            keys: RouteKeys::from_config(config)?,
            builder: EnvelopeBuilder::new(config),
            guard: TimeoutGuard::new(config.max_age_ms),
            tasks,
            monitor,
            reload,
        })
    }
}

/// How the pipeline disposed of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Pong,
    /// Reload acknowledged; the connection must stop reading.
    Reloading,
    /// Stale; nothing was sent.
    Dropped,
    Offloaded(TaskId),
    /// Empty ack sent, routed result discarded.
    Acknowledged,
    Responded,
    /// Answered with an error before routing (bad payload, full queue).
    Rejected,
}

impl Outcome {
    pub fn closes_connection(&self) -> bool {
        matches!(self, Self::Reloading)
    }
}

/// Per-worker view of a [`DispatchContext`].
#[derive(Clone)]
pub struct Pipeline {
    ctx: Arc<DispatchContext>,
    owner: Arc<str>,
    crash: CrashSignal,
}

impl Pipeline {
    pub fn new(ctx: Arc<DispatchContext>, worker: &WorkerDescriptor, crash: CrashSignal) -> Self {
        Self {
            ctx,
            owner: worker.label().into(),
            crash,
        }
    }

    pub fn builder(&self) -> &EnvelopeBuilder {
        &self.ctx.builder
    }

    /// Handle one raw payload from a TCP, UDP or WebSocket peer.
    pub async fn handle_payload(&self, payload: Bytes, handle: &ConnectionHandle) -> Outcome {
        let transport = handle.transport();
        let command = ControlCommand::classify(payload);
        if !matches!(command, ControlCommand::Data(_)) {
            metrics::record_control(command.name(), transport.as_str());
        }
        match command {
            ControlCommand::Ping => {
                if let Err(e) = handle.send(Bytes::from_static(PONG)).await {
                    tracing::debug!(%transport, error = %e, "Failed to answer ping");
                }
                Outcome::Pong
            }
            ControlCommand::Reload => {
                if let Err(e) = handle.send(Bytes::from_static(RELOAD_ACK)).await {
                    tracing::debug!(%transport, error = %e, "Failed to acknowledge reload");
                }
                self.ctx.reload.request(ReloadCause::Command);
                Outcome::Reloading
            }
            ControlCommand::Data(payload) => match self.ctx.builder.from_payload(&payload, handle.clone()) {
                Ok(envelope) => self.dispatch(envelope).await,
                Err(e) => {
                    tracing::warn!(%transport, error = %e, "Rejecting malformed payload");
                    let response = ResponseEnvelope::error(CODE_BAD_REQUEST, e.to_string());
                    reply::deliver(handle, &response).await;
                    Outcome::Rejected
                }
            },
        }
    }

    /// Dispatch a built envelope inside the crash boundary.
    pub async fn dispatch(&self, envelope: RequestEnvelope) -> Outcome {
        let ctx = RequestContext::capture(&envelope);
        crash::guarded(ctx, &self.crash, self.process(envelope)).await
    }

    async fn process(&self, envelope: RequestEnvelope) -> Outcome {
        let started = Instant::now();
        let transport = envelope.transport;

        if self.ctx.guard.is_stale(&envelope) {
            tracing::info!(
                request_id = %envelope.request_id,
                %transport,
                "Dropping stale request"
            );
            metrics::record_dropped(transport.as_str());
            return Outcome::Dropped;
        }

        let target = self
            .ctx
            .router
            .resolve_with(&self.ctx.keys, &envelope.params, envelope.path.as_deref());

        if envelope.flags.offload {
            return self.offload(envelope, target, started).await;
        }

        let ack_required = envelope.flags.ack_required;
        if !ack_required {
            if let Err(e) = reply::acknowledge(&envelope.handle).await {
                tracing::debug!(request_id = %envelope.request_id, error = %e, "Failed to send acknowledgement");
            }
        }

        let response = self.ctx.router.invoke(envelope.route_call(target.clone())).await;
        if ack_required {
            reply::deliver(&envelope.handle, &response).await;
        }

        self.ctx.monitor.record(MonitorRecord {
            target,
            transport,
            phase: Phase::Request,
            elapsed: started.elapsed(),
            code: response.code,
        });

        if ack_required {
            Outcome::Responded
        } else {
            Outcome::Acknowledged
        }
    }

    async fn offload(&self, envelope: RequestEnvelope, target: RouteTarget, started: Instant) -> Outcome {
        let transport = envelope.transport;
        let handle = envelope.handle.clone();

        let slot = match self.ctx.tasks.try_reserve() {
            Ok(slot) => slot,
            Err(e) => {
                tracing::warn!(request_id = %envelope.request_id, target_route = %target, error = %e, "Task rejected");
                let response = ResponseEnvelope::error(CODE_UNAVAILABLE, e.to_string());
                reply::deliver(&handle, &response).await;
                return Outcome::Rejected;
            }
        };

        let task_id = TaskId::generate(&self.owner);
        let response = ResponseEnvelope::task_accepted(&task_id);
        reply::deliver(&handle, &response).await;

        tracing::debug!(request_id = %envelope.request_id, task_id = %task_id, target_route = %target, "Task accepted");
        slot.submit(TaskDescriptor::new(task_id.clone(), target.clone(), envelope));

        self.ctx.monitor.record(MonitorRecord {
            target,
            transport,
            phase: Phase::Enqueue,
            elapsed: started.elapsed(),
            code: response.code,
        });
        Outcome::Offloaded(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use serde_json::{json, Value};

    use crate::dispatch::envelope::TransportKind;
    use crate::dispatch::reply::RecordingReply;
    use crate::dispatch::response::CODE_NOT_FOUND;
    use crate::dispatch::task::TaskPool;
    use crate::lifecycle::crash;
    use crate::lifecycle::signals::{reload_channel, ReloadReceiver};
    use crate::observability::monitor::MemorySink;
    use crate::routing::RouteCall;

    struct Harness {
        pipeline: Pipeline,
        sink: Arc<MemorySink>,
        calls: Arc<AtomicUsize>,
        reloads: ReloadReceiver,
        pool: TaskPool,
    }

    fn harness(config: RequestConfig) -> Harness {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let router = Arc::new(
            Router::new()
                .route(RouteTarget::new("main", "main"), |call: RouteCall| async move {
                    Ok(json!({ "echo": call.params.get("v").cloned().unwrap_or(Value::Null) }))
                })
                .route(RouteTarget::new("job", "slow"), move |_call: RouteCall| {
                    let counter = counter.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(json!("finished"))
                    }
                }),
        );

        let sink = MemorySink::new();
        let monitor = Monitor::new(sink.clone());
        let pool = TaskPool::spawn(1, 4, router.clone(), monitor.clone());
        let (reload, reloads) = reload_channel();
        let ctx = DispatchContext::from_config(&config, router, pool.queue(), monitor, reload).unwrap();
        let (signal, _crashes) = crash::channel();
        let worker = WorkerDescriptor::new(0, 1);

        Harness {
            pipeline: Pipeline::new(Arc::new(ctx), &worker, signal),
            sink,
            calls,
            reloads,
            pool,
        }
    }

    fn tcp_handle() -> (ConnectionHandle, Arc<RecordingReply>) {
        RecordingReply::handle(TransportKind::Tcp, json!(1))
    }

    async fn wait_for(reply: &RecordingReply, writes: usize) {
        for _ in 0..200 {
            if reply.sent().len() >= writes {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn ping_answers_pong_without_envelope() {
        let h = harness(RequestConfig::default());
        let (handle, reply) = tcp_handle();

        let outcome = h.pipeline.handle_payload(Bytes::from_static(b"ant-ping"), &handle).await;
        assert_eq!(outcome, Outcome::Pong);
        assert_eq!(reply.sent(), vec![Bytes::from_static(b"ant-pong")]);
        assert!(h.sink.records().is_empty());
    }

    #[tokio::test]
    async fn reload_acknowledges_then_signals() {
        let mut h = harness(RequestConfig::default());
        let (handle, reply) = tcp_handle();

        let outcome = h.pipeline.handle_payload(Bytes::from_static(b"ant-reload"), &handle).await;
        assert!(outcome.closes_connection());
        assert_eq!(reply.sent(), vec![Bytes::from_static(b"ok")]);
        assert!(matches!(h.reloads.try_recv(), Ok(ReloadCause::Command)));
    }

    #[tokio::test]
    async fn routed_result_is_the_only_response() {
        let h = harness(RequestConfig::default());
        let (handle, reply) = tcp_handle();

        let outcome = h.pipeline.handle_payload(Bytes::from_static(br#"{"v": 3}"#), &handle).await;
        assert_eq!(outcome, Outcome::Responded);
        assert_eq!(reply.responses(), vec![ResponseEnvelope::success(json!({"echo": 3}))]);

        let records = h.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target, RouteTarget::new("main", "main"));
        assert_eq!(records[0].phase, Phase::Request);
    }

    #[tokio::test]
    async fn suppressed_ack_sends_one_empty_envelope() {
        let h = harness(RequestConfig::default());
        let (handle, reply) = tcp_handle();

        let outcome = h
            .pipeline
            .handle_payload(Bytes::from_static(br#"{"a":"job","m":"slow","_recv":0}"#), &handle)
            .await;
        assert_eq!(outcome, Outcome::Acknowledged);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(reply.responses(), vec![ResponseEnvelope::empty()]);
    }

    #[tokio::test]
    async fn offload_acks_task_id_then_delivers_once() {
        let h = harness(RequestConfig::default());
        let (handle, reply) = tcp_handle();

        let outcome = h
            .pipeline
            .handle_payload(Bytes::from_static(br#"{"a":"job","m":"slow","_task":1}"#), &handle)
            .await;
        let Outcome::Offloaded(task_id) = outcome else {
            panic!("expected offload, got {outcome:?}");
        };

        wait_for(&reply, 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let responses = reply.responses();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0], ResponseEnvelope::task_accepted(&task_id));
        assert_eq!(responses[1], ResponseEnvelope::success(json!("finished")));

        let phases: Vec<Phase> = h.sink.records().iter().map(|r| r.phase).collect();
        assert_eq!(phases, vec![Phase::Enqueue, Phase::Task]);
        h.pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn stale_requests_are_dropped_silently() {
        let h = harness(RequestConfig {
            max_age_ms: 1_000,
            ..Default::default()
        });
        let (handle, reply) = tcp_handle();
        let old = SystemTime::now() - Duration::from_secs(10);
        let ms = old.duration_since(UNIX_EPOCH).unwrap().as_millis();
        let payload = format!(r#"{{"a":"job","m":"slow","_timestamp":{ms}}}"#);

        let outcome = h.pipeline.handle_payload(Bytes::from(payload), &handle).await;
        assert_eq!(outcome, Outcome::Dropped);
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert!(reply.sent().is_empty());
        assert!(h.sink.records().is_empty());
    }

    #[tokio::test]
    async fn errors_become_envelopes() {
        let h = harness(RequestConfig::default());
        let (handle, reply) = tcp_handle();

        let malformed = h.pipeline.handle_payload(Bytes::from_static(b"{oops"), &handle).await;
        assert_eq!(malformed, Outcome::Rejected);

        h.pipeline
            .handle_payload(Bytes::from_static(br#"{"a":"no","m":"where"}"#), &handle)
            .await;

        let codes: Vec<i64> = reply.responses().iter().map(|r| r.code).collect();
        assert_eq!(codes, vec![CODE_BAD_REQUEST, CODE_NOT_FOUND]);
    }
}
