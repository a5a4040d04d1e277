//! Worker supervision.
//!
//! # Responsibilities
//! - Start `worker_count` workers per configuration generation
//! - Respawn a crashed worker with the same index
//! - Perform graceful reloads: drain the generation, rebuild, restart
//! - Stop every worker on shutdown
//!
//! # Data Flow
//! ```text
//! ReloadCause (ant-reload, SIGHUP, config file change)
//!     → stop generation N (workers drain, owner flushes)
//!     → resolve the next config (file reload or the watcher's copy)
//!     → WorkerEnv::build (keep N's env if the new one is invalid)
//!     → start generation N+1 (owner loads)
//! ```
//!
//! # Design Decisions
//! - The listener survives reloads; a changed bind address or server kind
//!   is ignored with a warning until restart
//! - Reload requests that arrive while a reload is in progress are folded
//!   into it

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::{load_config, validate_config, GatewayConfig};
use crate::lifecycle::crash::panic_message;
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals::{ReloadCause, ReloadReceiver};
use crate::lifecycle::worker::{GatewayParts, Worker, WorkerDescriptor, WorkerEnv, WorkerExit};
use crate::observability::metrics;

/// Delay before a crashed worker is started again.
const RESPAWN_DELAY: Duration = Duration::from_millis(100);

/// Extra time a stopping generation gets beyond the drain timeout, for the
/// owner's flush.
const FLUSH_GRACE: Duration = Duration::from_secs(5);

struct Generation {
    number: u64,
    env: Arc<WorkerEnv>,
    stop: CancellationToken,
    workers: JoinSet<(WorkerDescriptor, WorkerExit)>,
}

impl Generation {
    fn start(number: u64, env: Arc<WorkerEnv>, worker_count: usize) -> Self {
        let mut generation = Self {
            number,
            env,
            stop: CancellationToken::new(),
            workers: JoinSet::new(),
        };
        let total = worker_count.max(1);
        for worker_id in 0..total {
            generation.spawn(WorkerDescriptor::new(worker_id, total), Duration::ZERO);
        }
        tracing::info!(generation = number, workers = total, "Workers started");
        generation
    }

    fn spawn(&mut self, descriptor: WorkerDescriptor, delay: Duration) {
        let env = self.env.clone();
        let stop = self.stop.clone();
        self.workers.spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = stop.cancelled() => return (descriptor, WorkerExit::Stopped),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let worker = Worker::new(descriptor, env.clone());
            let exit = match AssertUnwindSafe(worker.run(stop)).catch_unwind().await {
                Ok(exit) => exit,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(worker_id = descriptor.worker_id, panic = %message, "Worker panicked outside a request");
                    metrics::record_worker_crash(descriptor.worker_id);
                    if descriptor.is_resource_owner() {
                        env.resources.flush_all().await;
                    }
                    WorkerExit::Crashed(message)
                }
            };
            (descriptor, exit)
        });
    }

    fn on_exit(&mut self, joined: Result<(WorkerDescriptor, WorkerExit), JoinError>) {
        match joined {
            Ok((descriptor, WorkerExit::Crashed(reason))) => {
                tracing::warn!(
                    generation = self.number,
                    worker_id = descriptor.worker_id,
                    %reason,
                    "Respawning crashed worker"
                );
                self.spawn(descriptor, RESPAWN_DELAY);
            }
            Ok((descriptor, WorkerExit::Stopped)) => {
                tracing::debug!(generation = self.number, worker_id = descriptor.worker_id, "Worker stopped");
            }
            Err(e) => tracing::error!(generation = self.number, error = %e, "Worker task failed"),
        }
    }

    async fn stop(mut self, drain_timeout: Duration) {
        self.stop.cancel();
        let stopped = tokio::time::timeout(drain_timeout + FLUSH_GRACE, async {
            while self.workers.join_next().await.is_some() {}
        })
        .await;
        if stopped.is_err() {
            tracing::warn!(generation = self.number, remaining = self.workers.len(), "Workers did not stop in time, aborting");
            self.workers.abort_all();
        }
        tracing::info!(generation = self.number, "Workers stopped");
    }
}

/// Owns the workers for the lifetime of the gateway.
pub struct Supervisor {
    config: GatewayConfig,
    config_path: Option<PathBuf>,
    env: Arc<WorkerEnv>,
    parts: GatewayParts,
    reloads: ReloadReceiver,
}

impl Supervisor {
    pub fn new(
        config: GatewayConfig,
        config_path: Option<PathBuf>,
        env: WorkerEnv,
        parts: GatewayParts,
        reloads: ReloadReceiver,
    ) -> Self {
        Self {
            config,
            config_path,
            env: Arc::new(env),
            parts,
            reloads,
        }
    }

    /// Run workers until `shutdown` fires.
    pub async fn run(mut self, shutdown: &Shutdown) {
        let mut shutdown_rx = shutdown.subscribe();
        let mut generation = Generation::start(1, self.env.clone(), self.config.server.worker_count);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    generation.stop(self.drain_timeout()).await;
                    break;
                }
                Some(cause) = self.reloads.recv() => {
                    tracing::info!(generation = generation.number, cause = cause.as_str(), "Reload requested");
                    let next = generation.number + 1;
                    generation.stop(self.drain_timeout()).await;
                    self.apply_reload(cause);
                    generation = Generation::start(next, self.env.clone(), self.config.server.worker_count);
                }
                Some(joined) = generation.workers.join_next() => generation.on_exit(joined),
            }
        }
    }

    fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.config.server.drain_timeout_secs)
    }

    /// Pick the configuration for the next generation and rebuild the env.
    fn apply_reload(&mut self, cause: ReloadCause) {
        let cause = self.coalesce(cause);
        let candidate = match cause {
            ReloadCause::ConfigChanged(config) => Some(*config),
            ReloadCause::Command | ReloadCause::Signal => self.config_path.as_ref().and_then(|path| {
                load_config(path)
                    .map_err(|e| tracing::error!(error = %e, "Config reload failed, keeping current configuration"))
                    .ok()
            }),
        };
        let Some(mut next) = candidate else {
            return;
        };

        if next.listener.bind_address != self.config.listener.bind_address {
            tracing::warn!(
                current = %self.config.listener.bind_address,
                requested = %next.listener.bind_address,
                "Bind address changes need a restart"
            );
        }
        if next.server.kind != self.config.server.kind {
            tracing::warn!(
                current = %self.config.server.kind,
                requested = %next.server.kind,
                "Server kind changes need a restart"
            );
        }
        if next.server.task_worker_count != self.config.server.task_worker_count
            || next.server.task_queue_capacity != self.config.server.task_queue_capacity
        {
            tracing::warn!("Task pool sizing changes need a restart");
        }
        next.listener = self.config.listener.clone();
        next.server.kind = self.config.server.kind;
        next.server.task_worker_count = self.config.server.task_worker_count;
        next.server.task_queue_capacity = self.config.server.task_queue_capacity;

        if let Err(errors) = validate_config(&next) {
            for error in errors {
                tracing::error!(%error, "New configuration rejected");
            }
            return;
        }
        match WorkerEnv::build(&next, &self.parts) {
            Ok(env) => {
                self.env = Arc::new(env);
                self.config = next;
                tracing::info!("Configuration reloaded");
            }
            Err(e) => tracing::error!(error = %e, "New configuration rejected, keeping current configuration"),
        }
    }

    /// Fold queued reload requests into `first`. A config file change wins
    /// because it already carries the newest configuration.
    fn coalesce(&mut self, first: ReloadCause) -> ReloadCause {
        let mut cause = first;
        while let Ok(queued) = self.reloads.try_recv() {
            if matches!(queued, ReloadCause::ConfigChanged(_)) || !matches!(cause, ReloadCause::ConfigChanged(_)) {
                cause = queued;
            }
        }
        cause
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::config::ListenerConfig;
    use crate::dispatch::{TaskPool, TransportKind};
    use crate::lifecycle::resources::{ResourceError, SharedResource, SharedResources};
    use crate::lifecycle::signals::{reload_channel, ReloadHandle};
    use crate::net::BoundTransport;
    use crate::observability::monitor::Monitor;
    use crate::routing::Router;

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

    async fn supervisor(resource: Arc<CountingResource>) -> (Supervisor, ReloadHandle, TaskPool) {
        let mut config = GatewayConfig::default();
        config.listener = ListenerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            max_connections: 8,
        };
        config.server.kind = TransportKind::Udp;
        config.server.worker_count = 4;
        config.server.drain_timeout_secs = 1;

        let router = Arc::new(Router::new());
        let pool = TaskPool::spawn(1, 8, router.clone(), Monitor::default());
        let (reload, reloads) = reload_channel();
        let parts = GatewayParts {
            transport: BoundTransport::bind(&config.listener, TransportKind::Udp).await.unwrap(),
            router,
            resources: SharedResources::new(vec![resource as Arc<dyn SharedResource>]),
            monitor: Monitor::default(),
            tasks: pool.queue(),
            reload: reload.clone(),
        };
        let env = WorkerEnv::build(&config, &parts).unwrap();
        (Supervisor::new(config, None, env, parts, reloads), reload, pool)
    }

    async fn wait_for(counter: &AtomicUsize, expected: usize) {
        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("counter stuck at {}", counter.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn reload_flushes_then_loads_once_per_generation() {
        let resource = Arc::new(CountingResource::default());
        let (supervisor, reload, _pool) = supervisor(resource.clone()).await;
        let shutdown = Arc::new(Shutdown::new());

        let running = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { supervisor.run(&shutdown).await }
        });

        wait_for(&resource.loads, 1).await;
        assert_eq!(resource.flushes.load(Ordering::SeqCst), 0);

        assert!(reload.request(ReloadCause::Command));
        wait_for(&resource.loads, 2).await;
        assert_eq!(resource.flushes.load(Ordering::SeqCst), 1);

        shutdown.trigger();
        running.await.unwrap();
        assert_eq!(resource.loads.load(Ordering::SeqCst), 2);
        assert_eq!(resource.flushes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn queued_config_change_wins() {
        let resource = Arc::new(CountingResource::default());
        let (mut supervisor, reload, _pool) = supervisor(resource).await;

        let mut changed = supervisor.config.clone();
        changed.requests.max_age_ms = 250;
        reload.request(ReloadCause::ConfigChanged(Box::new(changed)));
        reload.request(ReloadCause::Signal);

        let cause = supervisor.coalesce(ReloadCause::Command);
        match cause {
            ReloadCause::ConfigChanged(config) => assert_eq!(config.requests.max_age_ms, 250),
            other => panic!("unexpected cause {}", other.as_str()),
        }
    }

    #[tokio::test]
    async fn reload_keeps_the_bound_listener() {
        let resource = Arc::new(CountingResource::default());
        let (mut supervisor, _reload, _pool) = supervisor(resource).await;

        let mut changed = supervisor.config.clone();
        changed.listener.bind_address = "127.0.0.1:1".to_string();
        changed.server.kind = TransportKind::Tcp;
        changed.requests.max_age_ms = 500;
        supervisor.apply_reload(ReloadCause::ConfigChanged(Box::new(changed)));

        assert_eq!(supervisor.config.listener.bind_address, "127.0.0.1:0");
        assert_eq!(supervisor.config.server.kind, TransportKind::Udp);
        assert_eq!(supervisor.config.requests.max_age_ms, 500);
    }
}
