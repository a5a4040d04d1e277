//! Connection lifecycle callbacks.
//!
//! The configured `on_open` / `on_connect` / `on_close` strings are parsed
//! into route targets once, when the gateway is built, and checked against
//! the route table. At runtime firing a hook is a table lookup.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::config::CallbackConfig;
use crate::dispatch::{Params, RequestId};
use crate::routing::router::{CallSource, RouteCall, RouteTarget, RouteTargetError, Router};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// WebSocket handshake completed.
    Open,
    /// TCP or WebSocket connection accepted.
    Connect,
    /// TCP or WebSocket connection closed.
    Close,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Connect => "connect",
            Self::Close => "close",
        })
    }
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("{field}: {source}")]
    InvalidTarget {
        field: String,
        #[source]
        source: RouteTargetError,
    },

    #[error("{field}: route {target} is not registered")]
    Unregistered { field: String, target: RouteTarget },
}

/// Parse a configured target and make sure the router knows it.
pub fn resolve_target(field: &str, value: &str, router: &Router) -> Result<RouteTarget, HookError> {
    let target: RouteTarget = value.parse().map_err(|source| HookError::InvalidTarget {
        field: field.to_string(),
        source,
    })?;
    if !router.contains(&target) {
        return Err(HookError::Unregistered {
            field: field.to_string(),
            target,
        });
    }
    Ok(target)
}

/// Typed dispatch table for lifecycle events.
pub struct LifecycleHooks {
    router: Arc<Router>,
    table: HashMap<LifecycleEvent, RouteTarget>,
}

impl LifecycleHooks {
    pub fn from_config(config: &CallbackConfig, router: Arc<Router>) -> Result<Self, HookError> {
        let mut table = HashMap::new();
        let entries = [
            (LifecycleEvent::Open, "callbacks.on_open", &config.on_open),
            (LifecycleEvent::Connect, "callbacks.on_connect", &config.on_connect),
            (LifecycleEvent::Close, "callbacks.on_close", &config.on_close),
        ];
        for (event, field, value) in entries {
            if let Some(value) = value {
                table.insert(event, resolve_target(field, value, &router)?);
            }
        }
        Ok(Self { router, table })
    }

    pub fn target(&self, event: LifecycleEvent) -> Option<&RouteTarget> {
        self.table.get(&event)
    }

    /// Invoke the hook for `event`, discarding its result.
    ///
    /// Returns whether a hook was configured.
    pub async fn fire(&self, event: LifecycleEvent, params: Params) -> bool {
        let Some(target) = self.table.get(&event) else {
            return false;
        };

        let response = self
            .router
            .invoke(RouteCall {
                target: target.clone(),
                params,
                request_id: RequestId::new(),
                source: CallSource::Lifecycle(event),
            })
            .await;
        tracing::debug!(%event, target_route = %target, code = response.code, "Lifecycle hook fired");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    #[test]
    fn unregistered_targets_are_rejected() {
        let router = Arc::new(Router::new());
        let config = CallbackConfig {
            on_connect: Some("conn/open".into()),
            ..Default::default()
        };
        let err = LifecycleHooks::from_config(&config, router).err().unwrap();
        assert!(matches!(err, HookError::Unregistered { .. }));
    }

    #[tokio::test]
    async fn fires_only_configured_events() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Arc::new(Router::new().route(RouteTarget::new("conn", "closed"), move |call| {
            let counter = counter.clone();
            async move {
                assert_eq!(call.source, CallSource::Lifecycle(LifecycleEvent::Close));
                assert_eq!(call.params["_fd"], 7);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            }
        }));
        let config = CallbackConfig {
            on_close: Some("conn/closed".into()),
            ..Default::default()
        };
        let hooks = LifecycleHooks::from_config(&config, router).unwrap();

        let mut params = Params::new();
        params.insert("_fd".into(), json!(7));
        assert!(!hooks.fire(LifecycleEvent::Connect, params.clone()).await);
        assert!(hooks.fire(LifecycleEvent::Close, params).await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
