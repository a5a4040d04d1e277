//! Route lookup and dispatch.
//!
//! # Responsibilities
//! - Store the controller/method → handler table
//! - Resolve a target from request params or the HTTP path
//! - Invoke the handler and turn its outcome into a response envelope
//!
//! # Design Decisions
//! - Immutable after construction (shared via Arc without locks)
//! - Resolution order: params, then path segments, then the default target
//! - Handler errors never escape: they become error envelopes

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::RequestConfig;
use crate::dispatch::response::{ResponseEnvelope, CODE_INTERNAL, CODE_NOT_FOUND};
use crate::dispatch::{Params, RequestId, TransportKind};
use crate::routing::hooks::LifecycleEvent;

/// A `(controller, method)` pair naming one handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteTarget {
    controller: String,
    method: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected 'controller/method', got '{0}'")]
pub struct RouteTargetError(pub String);

impl RouteTarget {
    pub fn new(controller: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
            method: method.into(),
        }
    }

    pub fn controller(&self) -> &str {
        &self.controller
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl FromStr for RouteTarget {
    type Err = RouteTargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim_matches('/');
        match trimmed.split_once('/') {
            Some((controller, method))
                if !controller.is_empty() && !method.is_empty() && !method.contains('/') =>
            {
                Ok(Self::new(controller, method))
            }
            _ => Err(RouteTargetError(s.to_string())),
        }
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.controller, self.method)
    }
}

/// Where a handler invocation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSource {
    Transport(TransportKind),
    Timer,
    Lifecycle(LifecycleEvent),
}

/// Everything a handler gets to see.
#[derive(Debug, Clone)]
pub struct RouteCall {
    pub target: RouteTarget,
    pub params: Params,
    pub request_id: RequestId,
    pub source: CallSource,
}

/// A failure reported by a handler.
#[derive(Debug, Clone, Error)]
#[error("handler failed with code {code}: {message}")]
pub struct HandlerError {
    pub code: i64,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CODE_INTERNAL, message)
    }
}

pub type HandlerResult = Result<Value, HandlerError>;

/// A business handler.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, call: RouteCall) -> HandlerResult;
}

/// Adapts an async closure into a [`Handler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(RouteCall) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn call(&self, call: RouteCall) -> HandlerResult {
        (self.0)(call).await
    }
}

/// Param names used to find a target in a request.
#[derive(Debug, Clone)]
pub struct RouteKeys {
    pub controller_key: String,
    pub method_key: String,
    pub default_target: RouteTarget,
}

impl RouteKeys {
    pub fn from_config(config: &RequestConfig) -> Result<Self, RouteTargetError> {
        Ok(Self {
            controller_key: config.controller_key.clone(),
            method_key: config.method_key.clone(),
            default_target: config.default_target.parse()?,
        })
    }
}

impl Default for RouteKeys {
    fn default() -> Self {
        Self {
            controller_key: "a".to_string(),
            method_key: "m".to_string(),
            default_target: RouteTarget::new("main", "main"),
        }
    }
}

/// The route table.
pub struct Router {
    keys: RouteKeys,
    handlers: HashMap<RouteTarget, Arc<dyn Handler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::with_keys(RouteKeys::default())
    }

    pub fn with_keys(keys: RouteKeys) -> Self {
        Self {
            keys,
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for `target`, replacing any previous one.
    pub fn register(mut self, target: RouteTarget, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(target, handler);
        self
    }

    /// Register an async closure for `target`.
    pub fn route<F, Fut>(self, target: RouteTarget, f: F) -> Self
    where
        F: Fn(RouteCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(target, Arc::new(FnHandler(f)))
    }

    pub fn contains(&self, target: &RouteTarget) -> bool {
        self.handlers.contains_key(target)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Find the target a request names, using the router's own keys.
    pub fn resolve(&self, params: &Params, path: Option<&str>) -> RouteTarget {
        self.resolve_with(&self.keys, params, path)
    }

    /// Find the target a request names using `keys`.
    pub fn resolve_with(&self, keys: &RouteKeys, params: &Params, path: Option<&str>) -> RouteTarget {
        let named = |key: &str| {
            params
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };
        if let (Some(controller), Some(method)) =
            (named(&keys.controller_key), named(&keys.method_key))
        {
            return RouteTarget::new(controller, method);
        }

        if let Some(path) = path {
            let mut segments = path.split('/').filter(|s| !s.is_empty());
            if let (Some(controller), Some(method)) = (segments.next(), segments.next()) {
                return RouteTarget::new(controller, method);
            }
        }

        keys.default_target.clone()
    }

    /// Run the handler for `call.target` and serialize its outcome.
    pub async fn invoke(&self, call: RouteCall) -> ResponseEnvelope {
        let Some(handler) = self.handlers.get(&call.target) else {
            tracing::warn!(target_route = %call.target, request_id = %call.request_id, "No handler registered");
            return ResponseEnvelope::error(CODE_NOT_FOUND, format!("route {} not found", call.target));
        };

        let target = call.target.clone();
        match handler.call(call).await {
            Ok(data) => ResponseEnvelope::success(data),
            Err(e) => {
                tracing::warn!(target_route = %target, code = e.code, error = %e.message, "Handler failed");
                ResponseEnvelope::error(e.code, e.message)
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
