//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration and the route table it names
//! - Initialize subsystems in dependency order
//! - Bind the shared listener and start the task pool
//! - Hand everything to the supervisor
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - Workers start last (traffic only when ready)

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::watcher::ConfigWatcher;
use crate::config::{load_config, validate_config, ConfigError, GatewayConfig, ValidationError};
use crate::dispatch::TaskPool;
use crate::lifecycle::resources::{SharedResource, SharedResources};
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals::{reload_channel, ReloadCause, ReloadHandle};
use crate::lifecycle::supervisor::Supervisor;
use crate::lifecycle::worker::{GatewayParts, WorkerEnv};
use crate::net::{BoundTransport, ListenerError};
use crate::observability::monitor::Monitor;
use crate::routing::{HookError, RouteTargetError, Router};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {}", join_errors(.0))]
    Invalid(Vec<ValidationError>),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid route keys: {0}")]
    RouteKeys(#[from] RouteTargetError),

    #[error("invalid callback: {0}")]
    Callback(#[from] HookError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Assembles a [`Gateway`].
pub struct GatewayBuilder {
    config: GatewayConfig,
    config_path: Option<PathBuf>,
    router: Router,
    resources: Vec<Arc<dyn SharedResource>>,
    monitor: Monitor,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            config_path: None,
            router: Router::new(),
            resources: Vec::new(),
            monitor: Monitor::default(),
        }
    }

    /// Load `path` and watch it for changes once the gateway runs.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, StartupError> {
        let path = path.as_ref();
        let config = load_config(path)?;
        Ok(Self::new(config).watch_config(path))
    }

    pub fn watch_config(mut self, path: impl AsRef<Path>) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    /// Add a resource loaded and flushed by the last worker.
    pub fn resource(mut self, resource: Arc<dyn SharedResource>) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Validate, bind the listener and prepare the first generation.
    pub async fn bind(self) -> Result<Gateway, StartupError> {
        let config = self.config;
        validate_config(&config).map_err(StartupError::Invalid)?;

        let router = Arc::new(self.router);
        tracing::info!(routes = router.len(), kind = %config.server.kind, "Starting gateway");

        let transport = BoundTransport::bind(&config.listener, config.server.kind).await?;
        let local_addr = transport.local_addr()?;

        let pool = TaskPool::spawn(
            config.server.task_worker_count,
            config.server.task_queue_capacity,
            router.clone(),
            self.monitor.clone(),
        );
        let (reload, reloads) = reload_channel();
        let parts = GatewayParts {
            transport,
            router,
            resources: SharedResources::new(self.resources),
            monitor: self.monitor,
            tasks: pool.queue(),
            reload: reload.clone(),
        };
        let env = WorkerEnv::build(&config, &parts)?;

        tracing::info!(address = %local_addr, workers = config.server.worker_count, "Gateway bound");
        let drain_timeout = Duration::from_secs(config.server.drain_timeout_secs);
        Ok(Gateway {
            local_addr,
            shutdown: Arc::new(Shutdown::new()),
            reload,
            watch_path: self.config_path.clone(),
            drain_timeout,
            pool,
            supervisor: Supervisor::new(config, self.config_path, env, parts, reloads),
        })
    }
}

/// A bound gateway, ready to run.
pub struct Gateway {
    local_addr: SocketAddr,
    shutdown: Arc<Shutdown>,
    reload: ReloadHandle,
    watch_path: Option<PathBuf>,
    drain_timeout: Duration,
    pool: TaskPool,
    supervisor: Supervisor,
}

impl Gateway {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn reload_handle(&self) -> ReloadHandle {
        self.reload.clone()
    }

    /// Trigger this to stop the gateway.
    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        self.shutdown.clone()
    }

    /// Serve until shutdown is triggered, then drain workers and tasks.
    pub async fn run(self) -> Result<(), StartupError> {
        let _watcher = match &self.watch_path {
            Some(path) => {
                let (watcher, mut updates) = ConfigWatcher::new(path);
                match watcher.run() {
                    Ok(watcher) => {
                        let reload = self.reload.clone();
                        tokio::spawn(async move {
                            while let Some(config) = updates.recv().await {
                                if !reload.request(ReloadCause::ConfigChanged(Box::new(config))) {
                                    break;
                                }
                            }
                        });
                        Some(watcher)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Config watcher unavailable, file changes need SIGHUP");
                        None
                    }
                }
            }
            None => None,
        };

        self.supervisor.run(&self.shutdown).await;
        self.pool.shutdown(self.drain_timeout).await;
        tracing::info!("Gateway stopped");
        Ok(())
    }
}
