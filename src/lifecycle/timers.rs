//! Periodic timers registered by worker 0.
//!
//! A timer invokes its route target every `interval`, starting one interval
//! after the worker comes up. The first tick never fires immediately.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::TimerConfig;
use crate::dispatch::{Params, RequestId};
use crate::lifecycle::crash::{panic_message, CrashReport, CrashSignal};
use crate::routing::hooks::resolve_target;
use crate::routing::{CallSource, HookError, RouteCall, RouteTarget, Router};

/// A validated timer.
#[derive(Debug, Clone)]
pub struct TimerSpec {
    pub interval: Duration,
    pub target: RouteTarget,
    pub params: Params,
}

impl TimerSpec {
    pub fn from_config(index: usize, config: &TimerConfig, router: &Router) -> Result<Self, HookError> {
        let field = format!("timers[{index}].callback");
        Ok(Self {
            interval: Duration::from_millis(config.interval_ms),
            target: resolve_target(&field, &config.callback, router)?,
            params: config.params.clone(),
        })
    }

    pub fn all_from_config(timers: &[TimerConfig], router: &Router) -> Result<Vec<Self>, HookError> {
        timers
            .iter()
            .enumerate()
            .map(|(index, config)| Self::from_config(index, config, router))
            .collect()
    }
}

/// Running timers of one worker. Dropping the set stops them.
#[derive(Default)]
pub struct TimerSet {
    tasks: JoinSet<()>,
}

impl TimerSet {
    pub fn start(specs: &[TimerSpec], router: Arc<Router>, crash: CrashSignal) -> Self {
        let mut tasks = JoinSet::new();
        for spec in specs {
            tasks.spawn(tick(spec.clone(), router.clone(), crash.clone()));
        }
        if !specs.is_empty() {
            tracing::info!(timers = specs.len(), "Timers registered");
        }
        Self { tasks }
    }

    pub fn stop(mut self) {
        self.tasks.abort_all();
    }
}

async fn tick(spec: TimerSpec, router: Arc<Router>, crash: CrashSignal) {
    let mut ticker = tokio::time::interval_at(Instant::now() + spec.interval, spec.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let call = RouteCall {
            target: spec.target.clone(),
            params: spec.params.clone(),
            request_id: RequestId::new(),
            source: CallSource::Timer,
        };

        match AssertUnwindSafe(router.invoke(call)).catch_unwind().await {
            Ok(response) => {
                tracing::trace!(target_route = %spec.target, code = response.code, "Timer fired");
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(target_route = %spec.target, panic = %message, "Timer callback crashed its worker");
                crash.raise(CrashReport {
                    request_id: None,
                    message,
                });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use crate::lifecycle::crash;

    fn counting_router(hits: Arc<AtomicUsize>) -> Arc<Router> {
        Arc::new(Router::new().route(RouteTarget::new("cron", "tick"), move |call| {
            let hits = hits.clone();
            async move {
                assert_eq!(call.source, CallSource::Timer);
                assert_eq!(call.params["job"], json!("sweep"));
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            }
        }))
    }

    fn config(interval_ms: u64, callback: &str) -> TimerConfig {
        let mut params = Params::new();
        params.insert("job".into(), json!("sweep"));
        TimerConfig {
            interval_ms,
            callback: callback.into(),
            params,
        }
    }

    #[test]
    fn unknown_callbacks_are_rejected() {
        let router = counting_router(Arc::new(AtomicUsize::new(0)));
        let err = TimerSpec::all_from_config(&[config(10, "cron/tick"), config(10, "cron/missing")], &router)
            .unwrap_err();
        assert!(err.to_string().starts_with("timers[1].callback"));
    }

    #[tokio::test]
    async fn ticks_until_stopped() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = counting_router(hits.clone());
        let specs = TimerSpec::all_from_config(&[config(20, "cron/tick")], &router).unwrap();
        let (signal, _crashes) = crash::channel();

        let timers = TimerSet::start(&specs, router, signal);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(150)).await;
        timers.stop();

        let fired = hits.load(Ordering::SeqCst);
        assert!(fired >= 2, "fired {fired} times");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(hits.load(Ordering::SeqCst), fired);
    }

    #[tokio::test]
    async fn panicking_callback_raises_a_crash() {
        let router = Arc::new(Router::new().route(RouteTarget::new("cron", "boom"), |_call| async move {
            if true {
                panic!("timer exploded");
            }
            Ok(json!(null))
        }));
        let specs = TimerSpec::all_from_config(&[config(10, "cron/boom")], &router).unwrap();
        let (signal, mut crashes) = crash::channel();

        let _timers = TimerSet::start(&specs, router, signal);
        let report = tokio::time::timeout(Duration::from_secs(2), crashes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.message, "timer exploded");
        assert!(report.request_id.is_none());
    }
}
