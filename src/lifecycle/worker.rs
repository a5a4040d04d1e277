//! Accepting workers.
//!
//! # Responsibilities
//! - Accept connections or datagrams from the shared transport
//! - Own every connection it accepts until that connection ends
//! - Run the configured timers (worker 0 only)
//! - Load and flush shared resources (the last worker only)
//!
//! # States
//! ```text
//! Starting → Running → Stopping   (stop token cancelled, connections drain)
//!                    → Crashed    (a request, hook or timer panicked)
//! ```
//!
//! # Design Decisions
//! - A worker is a tokio task; all workers of a generation share one
//!   `WorkerEnv`
//! - A crash aborts the worker's connections instead of draining them
//! - The resource owner flushes on both exits, so a respawned owner loads
//!   what its predecessor flushed

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::dispatch::{DispatchContext, Pipeline, TaskQueue, TransportKind};
use crate::http::{self, HttpState};
use crate::lifecycle::crash::{self, panic_message};
use crate::lifecycle::resources::SharedResources;
use crate::lifecycle::signals::ReloadHandle;
use crate::lifecycle::startup::StartupError;
use crate::lifecycle::timers::{TimerSet, TimerSpec};
use crate::net::connection::ConnectionTracker;
use crate::net::{tcp, udp, BoundTransport, ConnectionContext, Inbound, ListenerError};
use crate::observability::metrics;
use crate::observability::monitor::Monitor;
use crate::routing::{LifecycleHooks, Router};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
const CRASH_FLUSH: Duration = Duration::from_millis(200);

/// Which worker this is, out of how many.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerDescriptor {
    pub worker_id: usize,
    pub total_workers: usize,
}

impl WorkerDescriptor {
    pub fn new(worker_id: usize, total_workers: usize) -> Self {
        Self {
            worker_id,
            total_workers,
        }
    }

    /// The highest-indexed worker owns the shared resources.
    pub fn is_resource_owner(&self) -> bool {
        self.worker_id + 1 == self.total_workers
    }

    pub fn registers_timers(&self) -> bool {
        self.worker_id == 0
    }

    /// Process-unique name, used to seed task ids.
    pub fn label(&self) -> String {
        format!("{}:{}", std::process::id(), self.worker_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Stopped,
    Crashed(String),
}

/// Pieces that outlive configuration generations.
#[derive(Clone)]
pub struct GatewayParts {
    pub transport: BoundTransport,
    pub router: Arc<Router>,
    pub resources: SharedResources,
    pub monitor: Monitor,
    pub tasks: TaskQueue,
    pub reload: ReloadHandle,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub kind: TransportKind,
    pub drain_timeout: Duration,
    pub max_frame_bytes: usize,
    pub request_timeout: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            kind: config.server.kind,
            drain_timeout: Duration::from_secs(config.server.drain_timeout_secs),
            max_frame_bytes: config.server.max_frame_bytes,
            request_timeout: Duration::from_secs(config.timeouts.request_secs),
        }
    }
}

/// Everything the workers of one generation share.
pub struct WorkerEnv {
    pub transport: BoundTransport,
    pub dispatch: Arc<DispatchContext>,
    pub hooks: Arc<LifecycleHooks>,
    pub timers: Arc<Vec<TimerSpec>>,
    pub resources: SharedResources,
    pub settings: WorkerSettings,
}

impl WorkerEnv {
    /// Resolve every configured target against the route table.
    pub fn build(config: &GatewayConfig, parts: &GatewayParts) -> Result<Self, StartupError> {
        let dispatch = DispatchContext::from_config(
            &config.requests,
            parts.router.clone(),
            parts.tasks.clone(),
            parts.monitor.clone(),
            parts.reload.clone(),
        )?;
        let hooks = LifecycleHooks::from_config(&config.callbacks, parts.router.clone())?;
        let timers = TimerSpec::all_from_config(&config.timers, &parts.router)?;

        let settings = WorkerSettings::from_config(config);
        if !settings.kind.has_connection_events()
            && (config.callbacks.on_connect.is_some() || config.callbacks.on_close.is_some())
        {
            tracing::warn!(kind = %settings.kind, "Connection callbacks are configured but never fire for this transport");
        }
        if settings.kind != TransportKind::WebSocket && config.callbacks.on_open.is_some() {
            tracing::warn!(kind = %settings.kind, "on_open only fires for WebSocket servers");
        }

        Ok(Self {
            transport: parts.transport.clone(),
            dispatch: Arc::new(dispatch),
            hooks: Arc::new(hooks),
            timers: Arc::new(timers),
            resources: parts.resources.clone(),
            settings,
        })
    }
}

pub struct Worker {
    descriptor: WorkerDescriptor,
    env: Arc<WorkerEnv>,
    state: WorkerState,
}

impl Worker {
    pub fn new(descriptor: WorkerDescriptor, env: Arc<WorkerEnv>) -> Self {
        Self {
            descriptor,
            env,
            state: WorkerState::Starting,
        }
    }

    fn transition(&mut self, next: WorkerState) {
        tracing::info!(
            worker_id = self.descriptor.worker_id,
            from = %self.state,
            to = %next,
            "Worker state change"
        );
        self.state = next;
    }

    /// Serve until `stop` is cancelled or something crashes the worker.
    pub async fn run(mut self, stop: CancellationToken) -> WorkerExit {
        let env = self.env.clone();
        let worker_id = self.descriptor.worker_id;
        let owner = self.descriptor.is_resource_owner();
        let (signal, mut crashes) = crash::channel();
        let drain = stop.child_token();

        if owner && !env.resources.is_empty() {
            env.resources.load_all().await;
        }
        let timers = if self.descriptor.registers_timers() {
            TimerSet::start(&env.timers, env.dispatch.router.clone(), signal.clone())
        } else {
            TimerSet::default()
        };

        let pipeline = Pipeline::new(env.dispatch.clone(), &self.descriptor, signal);
        let ctx = ConnectionContext {
            pipeline: pipeline.clone(),
            hooks: env.hooks.clone(),
            drain: drain.clone(),
            max_frame_bytes: env.settings.max_frame_bytes,
        };
        let app = match env.settings.kind {
            TransportKind::Http | TransportKind::WebSocket => Some(http::build_router(
                HttpState {
                    conn: ctx.clone(),
                    websocket: env.settings.kind == TransportKind::WebSocket,
                },
                env.settings.request_timeout,
            )),
            TransportKind::Tcp | TransportKind::Udp => None,
        };
        let tracker = ConnectionTracker::new(worker_id);
        let mut connections = JoinSet::new();

        self.transition(WorkerState::Running);

        let exit = loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break WorkerExit::Stopped,
                Some(report) = crashes.recv() => break WorkerExit::Crashed(report.message),
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            break WorkerExit::Crashed(panic_message(e.into_panic().as_ref()));
                        }
                    }
                }
                inbound = env.transport.next() => match inbound {
                    Ok(Inbound::Stream(stream, peer, permit)) => {
                        let guard = tracker.track();
                        tracing::debug!(worker_id, connection_id = %guard.id(), %peer, "Connection accepted");
                        match &app {
                            Some(app) => connections.spawn(http::serve_connection(
                                stream,
                                peer,
                                guard,
                                permit,
                                app.clone(),
                                ctx.clone(),
                            )),
                            None => connections.spawn(tcp::serve_connection(stream, peer, guard, permit, ctx.clone())),
                        };
                    }
                    Ok(Inbound::Datagram(payload, peer)) => {
                        if let BoundTransport::Datagram(socket) = &env.transport {
                            connections.spawn(udp::handle_datagram(pipeline.clone(), socket.clone(), payload, peer));
                        }
                    }
                    Err(ListenerError::Closed) => {
                        tracing::error!(worker_id, "Listener closed");
                        break WorkerExit::Crashed("listener closed".to_string());
                    }
                    Err(e) => {
                        tracing::warn!(worker_id, error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        };

        timers.stop();
        drain.cancel();

        match &exit {
            WorkerExit::Stopped => {
                self.transition(WorkerState::Stopping);
                if !join_within(&mut connections, env.settings.drain_timeout).await {
                    tracing::warn!(
                        worker_id,
                        remaining = connections.len(),
                        "Connections did not drain in time, aborting"
                    );
                    connections.abort_all();
                }
            }
            WorkerExit::Crashed(message) => {
                self.transition(WorkerState::Crashed);
                tracing::error!(worker_id, reason = %message, active = tracker.active_count(), "Worker crashed");
                metrics::record_worker_crash(worker_id);
                // Connections are already draining; give them a moment to
                // write the crash answer before they are cut.
                if !join_within(&mut connections, CRASH_FLUSH).await {
                    connections.abort_all();
                }
            }
        }

        if owner && !env.resources.is_empty() {
            env.resources.flush_all().await;
        }
        exit
    }
}

/// Join every connection task, giving up after `limit`.
async fn join_within(connections: &mut JoinSet<()>, limit: Duration) -> bool {
    tokio::time::timeout(limit, async {
        while connections.join_next().await.is_some() {}
    })
    .await
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::net::UdpSocket;

    use crate::config::ListenerConfig;
    use crate::dispatch::{ResponseEnvelope, TaskPool};
    use crate::lifecycle::resources::{ResourceError, SharedResource};
    use crate::lifecycle::signals::reload_channel;
    use crate::routing::RouteTarget;

    #[derive(Default)]
    struct CountingResource {
        loads: AtomicUsize,
        flushes: AtomicUsize,
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

    async fn udp_env(router: Router, resource: Arc<CountingResource>) -> (Arc<WorkerEnv>, TaskPool) {
        let listener = ListenerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            max_connections: 8,
        };
        let mut config = GatewayConfig::default();
        config.server.kind = TransportKind::Udp;
        config.server.drain_timeout_secs = 1;

        let router = Arc::new(router);
        let pool = TaskPool::spawn(1, 8, router.clone(), Monitor::default());
        let (reload, _reloads) = reload_channel();
        let parts = GatewayParts {
            transport: BoundTransport::bind(&listener, TransportKind::Udp).await.unwrap(),
            router,
            resources: SharedResources::new(vec![resource as Arc<dyn SharedResource>]),
            monitor: Monitor::default(),
            tasks: pool.queue(),
            reload,
        };
        (Arc::new(WorkerEnv::build(&config, &parts).unwrap()), pool)
    }

    #[test]
    fn ownership_roles() {
        let last = WorkerDescriptor::new(3, 4);
        assert!(last.is_resource_owner());
        assert!(!last.registers_timers());

        let first = WorkerDescriptor::new(0, 4);
        assert!(!first.is_resource_owner());
        assert!(first.registers_timers());

        let only = WorkerDescriptor::new(0, 1);
        assert!(only.is_resource_owner() && only.registers_timers());
        assert!(only.label().ends_with(":0"));
    }

    #[tokio::test]
    async fn owner_loads_and_flushes_on_stop() {
        let resource = Arc::new(CountingResource::default());
        let (env, _pool) = udp_env(Router::new(), resource.clone()).await;

        let stop = CancellationToken::new();
        let owner = tokio::spawn(Worker::new(WorkerDescriptor::new(1, 2), env.clone()).run(stop.clone()));
        let other = tokio::spawn(Worker::new(WorkerDescriptor::new(0, 2), env).run(stop.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(resource.loads.load(Ordering::SeqCst), 1);
        stop.cancel();

        assert_eq!(owner.await.unwrap(), WorkerExit::Stopped);
        assert_eq!(other.await.unwrap(), WorkerExit::Stopped);
        assert_eq!(resource.loads.load(Ordering::SeqCst), 1);
        assert_eq!(resource.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panic_answers_the_request_and_crashes_the_worker() {
        let router = Router::new().route(RouteTarget::new("main", "main"), |_call| async move {
            if true {
                panic!("handler exploded");
            }
            Ok(json!(null))
        });
        let resource = Arc::new(CountingResource::default());
        let (env, _pool) = udp_env(router, resource.clone()).await;
        let addr = env.transport.local_addr().unwrap();

        let stop = CancellationToken::new();
        let worker = tokio::spawn(Worker::new(WorkerDescriptor::new(0, 1), env).run(stop));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"{}", addr).await.unwrap();

        let mut buf = [0u8; 1024];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let response: ResponseEnvelope = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(response.code, 500);

        let exit = tokio::time::timeout(Duration::from_secs(2), worker).await.unwrap().unwrap();
        assert_eq!(exit, WorkerExit::Crashed("handler exploded".to_string()));
        assert_eq!(resource.flushes.load(Ordering::SeqCst), 1);
    }
}
