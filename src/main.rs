//! ant-gateway
//!
//! A multi-transport request gateway built with Tokio and Axum.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌──────────────────────────────────────────────────────┐
//!                      │                      GATEWAY                          │
//!                      │                                                       │
//!   TCP / UDP /        │  ┌──────────┐   ┌──────────┐   ┌──────────────────┐   │
//!   HTTP / WS  ────────┼─▶│ listener │──▶│ worker N │──▶│ control command  │   │
//!                      │  │ (shared) │   │ (owns    │   │ ping / reload    │   │
//!                      │  └──────────┘   │  conns)  │   └────────┬─────────┘   │
//!                      │                 └──────────┘            ▼             │
//!                      │                                ┌──────────────────┐   │
//!                      │                                │ envelope + guard │   │
//!                      │                                └────────┬─────────┘   │
//!                      │                     offload ┌───────────┴──────┐      │
//!                      │                  ┌──────────┤      router      │      │
//!                      │                  ▼          └───────────┬──────┘      │
//!                      │          ┌──────────────┐               │             │
//!   Reply ◀────────────┼──────────┤  task pool   │◀── reply ─────┘             │
//!                      │          └──────────────┘                             │
//!                      │                                                       │
//!                      │  supervisor · timers · shared resources · metrics     │
//!                      └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::Value;

use ant_gateway::config::GatewayConfig;
use ant_gateway::lifecycle::{signals, FileCache, GatewayBuilder};
use ant_gateway::observability::{logging, metrics};
use ant_gateway::routing::{HandlerError, HandlerResult, RouteCall, RouteTarget, Router};

#[derive(Parser)]
#[command(name = "ant-gateway")]
#[command(about = "Multi-transport request gateway", long_about = None)]
struct Args {
    /// TOML configuration file. Watched for changes while running.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let builder = match &args.config {
        Some(path) => GatewayBuilder::from_file(path)?,
        None => GatewayBuilder::new(GatewayConfig::default()),
    };
    let config = builder.config().clone();

    if let Err(e) = logging::init_logging(&config.observability) {
        eprintln!("failed to initialize logging: {e}");
    }
    tracing::info!("ant-gateway v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        kind = %config.server.kind,
        workers = config.server.worker_count,
        task_workers = config.server.task_worker_count,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let cache = config
        .resources
        .cache_path
        .as_ref()
        .map(|path| Arc::new(FileCache::new(path)));

    let mut builder = builder.router(demo_router(cache.clone()));
    if let Some(cache) = cache {
        builder = builder.resource(cache);
    }

    let gateway = builder.bind().await?;
    tracing::info!(address = %gateway.local_addr(), "Listening");

    tokio::spawn(signals::listen(gateway.shutdown_handle(), gateway.reload_handle()));
    gateway.run().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// `main/main` echoes its params; `cache/get` and `cache/set` are served
/// when a cache file is configured.
fn demo_router(cache: Option<Arc<FileCache>>) -> Router {
    let router = Router::new().route(RouteTarget::new("main", "main"), echo);
    let Some(cache) = cache else {
        return router;
    };

    let reader = cache.clone();
    router
        .route(RouteTarget::new("cache", "get"), move |call| cache_get(reader.clone(), call))
        .route(RouteTarget::new("cache", "set"), move |call| cache_set(cache.clone(), call))
}

async fn echo(call: RouteCall) -> HandlerResult {
    Ok(Value::Object(call.params))
}

fn cache_key(call: &RouteCall) -> Result<String, HandlerError> {
    call.params
        .get("key")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| HandlerError::new(400, "missing key"))
}

async fn cache_get(cache: Arc<FileCache>, call: RouteCall) -> HandlerResult {
    let key = cache_key(&call)?;
    Ok(cache.get(&key).unwrap_or(Value::Null))
}

async fn cache_set(cache: Arc<FileCache>, call: RouteCall) -> HandlerResult {
    let key = cache_key(&call)?;
    let value = call.params.get("value").cloned().unwrap_or(Value::Null);
    cache.insert(key, value.clone());
    Ok(value)
}
