//! OS signal handling and reload requests.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to internal events
//! - Carry reload requests from any source to the supervisor
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGHUP triggers a reload, not shutdown
//! - `ant-reload`, SIGHUP and config file changes share one channel

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::GatewayConfig;
use crate::lifecycle::shutdown::Shutdown;

/// Why a reload was requested.
#[derive(Debug, Clone)]
pub enum ReloadCause {
    /// An `ant-reload` control command.
    Command,
    /// SIGHUP.
    Signal,
    /// The watched configuration file changed and validated.
    ConfigChanged(Box<GatewayConfig>),
}

impl ReloadCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Signal => "signal",
            Self::ConfigChanged(_) => "config",
        }
    }
}

/// Requests a graceful reload of every worker.
#[derive(Debug, Clone)]
pub struct ReloadHandle(mpsc::UnboundedSender<ReloadCause>);

pub type ReloadReceiver = mpsc::UnboundedReceiver<ReloadCause>;

pub fn reload_channel() -> (ReloadHandle, ReloadReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ReloadHandle(tx), rx)
}

impl ReloadHandle {
    /// Returns false once the supervisor has stopped.
    pub fn request(&self, cause: ReloadCause) -> bool {
        tracing::info!(cause = cause.as_str(), "Reload requested");
        self.0.send(cause).is_ok()
    }
}

/// Translate process signals until shutdown is triggered.
pub async fn listen(shutdown: Arc<Shutdown>, reload: ReloadHandle) {
    let mut stop = shutdown.subscribe();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut hangup, mut terminate) = match (signal(SignalKind::hangup()), signal(SignalKind::terminate())) {
            (Ok(hangup), Ok(terminate)) => (hangup, terminate),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(error = %e, "Failed to install signal handlers");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = stop.recv() => return,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupt received, shutting down");
                    shutdown.trigger();
                    return;
                }
                _ = terminate.recv() => {
                    tracing::info!("SIGTERM received, shutting down");
                    shutdown.trigger();
                    return;
                }
                _ = hangup.recv() => {
                    reload.request(ReloadCause::Signal);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = &reload;
        tokio::select! {
            _ = stop.recv() => {}
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for interrupt");
                    return;
                }
                tracing::info!("Interrupt received, shutting down");
                shutdown.trigger();
            }
        }
    }
}
