//! Request envelope construction.
//!
//! # Responsibilities
//! - Normalize raw payloads and HTTP request sources into one param map
//! - Derive the acknowledgement/offload flags from caller params
//! - Stamp each envelope with a fresh request ID and creation time
//! - Capture the connection handle used for every reply
//!
//! # Design Decisions
//! - Route resolution is not done here; the router owns it
//! - HTTP sources merge additively: query, then body, then cookies, then
//!   headers, and an earlier source keeps a key a later one also sets
//! - `_fd` always reflects the real connection, never the caller's value

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::config::RequestConfig;
use crate::dispatch::reply::ConnectionHandle;
use crate::routing::{CallSource, RouteCall, RouteTarget};

/// Normalized request parameters.
pub type Params = Map<String, Value>;

/// Param key carrying the connection descriptor.
pub const DESCRIPTOR_KEY: &str = "_fd";

/// Transport a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Http,
    #[serde(alias = "ws")]
    WebSocket,
    Udp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Http => "http",
            Self::WebSocket => "websocket",
            Self::Udp => "udp",
        }
    }

    /// Whether connections of this kind fire connect/close callbacks.
    pub fn has_connection_events(&self) -> bool {
        matches!(self, Self::Tcp | Self::WebSocket)
    }

    /// Whether this kind is served over a stream listener.
    pub fn is_stream(&self) -> bool {
        !matches!(self, Self::Udp)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identifier for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Caller intent derived from params.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    /// The caller waits for the routed result.
    pub ack_required: bool,
    /// The caller wants the request run on the task pool.
    pub offload: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            ack_required: true,
            offload: false,
        }
    }
}

/// One normalized inbound request.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub transport: TransportKind,
    pub params: Params,
    pub flags: Flags,
    /// Request path, HTTP only.
    pub path: Option<String>,
    pub handle: ConnectionHandle,
    pub request_id: RequestId,
    pub created_at: SystemTime,
}

impl RequestEnvelope {
    /// Build the handler call for `target`.
    pub fn route_call(&self, target: RouteTarget) -> RouteCall {
        RouteCall {
            target,
            params: self.params.clone(),
            request_id: self.request_id,
            source: CallSource::Transport(self.transport),
        }
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload must be a JSON object")]
    NotAnObject,
}

/// Turns a raw TCP/UDP/WebSocket payload into params.
pub trait PayloadParser: Send + Sync {
    fn parse(&self, payload: &[u8]) -> Result<Params, EnvelopeError>;
}

/// Parses JSON objects. An empty payload yields no params.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPayloadParser;

impl PayloadParser for JsonPayloadParser {
    fn parse(&self, payload: &[u8]) -> Result<Params, EnvelopeError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(Params::new());
        }
        match serde_json::from_slice(payload)? {
            Value::Object(map) => Ok(map),
            _ => Err(EnvelopeError::NotAnObject),
        }
    }
}

/// The separate param sources of one HTTP request.
#[derive(Debug, Clone, Default)]
pub struct HttpSources {
    pub path: String,
    pub query: Params,
    pub body: Params,
    pub cookies: Params,
    pub headers: Params,
}

/// Param names carrying request flags.
#[derive(Debug, Clone)]
pub struct FlagKeys {
    pub ack: String,
    pub offload: String,
    pub timestamp: String,
}

impl FlagKeys {
    pub fn from_config(config: &RequestConfig) -> Self {
        Self {
            ack: config.ack_key.clone(),
            offload: config.offload_key.clone(),
            timestamp: config.timestamp_key.clone(),
        }
    }
}

impl Default for FlagKeys {
    fn default() -> Self {
        Self::from_config(&RequestConfig::default())
    }
}

/// Builds envelopes for every transport.
#[derive(Clone)]
pub struct EnvelopeBuilder {
    parser: Arc<dyn PayloadParser>,
    keys: FlagKeys,
}

impl EnvelopeBuilder {
    pub fn new(config: &RequestConfig) -> Self {
        Self {
            parser: Arc::new(JsonPayloadParser),
            keys: FlagKeys::from_config(config),
        }
    }

    /// Replace the payload parser.
    pub fn with_parser(mut self, parser: Arc<dyn PayloadParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Build an envelope from a TCP, UDP or WebSocket payload.
    pub fn from_payload(
        &self,
        payload: &[u8],
        handle: ConnectionHandle,
    ) -> Result<RequestEnvelope, EnvelopeError> {
        let params = self.parser.parse(payload)?;
        let transport = handle.transport();
        Ok(self.finish(transport, params, None, handle))
    }

    /// Build an envelope from the sources of an HTTP request.
    pub fn from_http(&self, sources: HttpSources, handle: ConnectionHandle) -> RequestEnvelope {
        let HttpSources {
            path,
            query,
            body,
            cookies,
            headers,
        } = sources;

        let mut params = query;
        merge_additive(&mut params, body);
        merge_additive(&mut params, cookies);
        merge_additive(&mut params, headers);

        self.finish(TransportKind::Http, params, Some(path), handle)
    }

    fn finish(
        &self,
        transport: TransportKind,
        mut params: Params,
        path: Option<String>,
        handle: ConnectionHandle,
    ) -> RequestEnvelope {
        params.insert(DESCRIPTOR_KEY.to_string(), handle.descriptor());

        let flags = Flags {
            ack_required: params.get(&self.keys.ack).map_or(true, is_truthy),
            offload: params.get(&self.keys.offload).is_some_and(is_truthy),
        };
        let created_at = params
            .get(&self.keys.timestamp)
            .and_then(timestamp_millis)
            .map(|ms| UNIX_EPOCH + Duration::from_millis(ms))
            .unwrap_or_else(SystemTime::now);

        RequestEnvelope {
            transport,
            params,
            flags,
            path,
            handle,
            request_id: RequestId::new(),
            created_at,
        }
    }
}

/// Params carrying only the connection descriptor, for lifecycle callbacks.
pub fn descriptor_params(handle: &ConnectionHandle) -> Params {
    let mut params = Params::new();
    params.insert(DESCRIPTOR_KEY.to_string(), handle.descriptor());
    params
}

/// Insert every entry of `source` whose key `target` does not have yet.
pub fn merge_additive(target: &mut Params, source: Params) {
    for (key, value) in source {
        target.entry(key).or_insert(value);
    }
}

/// Loose truthiness used for flag params.
///
/// `false`, `0`, `"0"`, `""`, `null` and empty containers are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !(s.is_empty() || s == "0"),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn timestamp_millis(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::reply::RecordingReply;
    use serde_json::json;

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn truthiness() {
        for falsy in [json!(null), json!(false), json!(0), json!("0"), json!(""), json!([]), json!({})] {
            assert!(!is_truthy(&falsy), "{falsy} should be falsy");
        }
        for truthy in [json!(true), json!(1), json!("1"), json!("no"), json!([0]), json!(0.5)] {
            assert!(is_truthy(&truthy), "{truthy} should be truthy");
        }
    }

    #[test]
    fn payload_flags_and_descriptor() {
        let builder = EnvelopeBuilder::new(&RequestConfig::default());
        let (handle, _reply) = RecordingReply::handle(TransportKind::Tcp, json!(12));

        let envelope = builder
            .from_payload(br#"{"a":"user","_recv":0,"_task":1,"_fd":99}"#, handle.clone())
            .unwrap();
        assert_eq!(envelope.transport, TransportKind::Tcp);
        assert!(!envelope.flags.ack_required);
        assert!(envelope.flags.offload);
        assert_eq!(envelope.params["_fd"], json!(12));

        let plain = builder.from_payload(b"", handle).unwrap();
        assert_eq!(plain.flags, Flags::default());
        assert_ne!(plain.request_id, envelope.request_id);
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let builder = EnvelopeBuilder::new(&RequestConfig::default());
        let (handle, _reply) = RecordingReply::handle(TransportKind::Udp, json!({}));
        assert!(matches!(
            builder.from_payload(b"{nope", handle.clone()),
            Err(EnvelopeError::InvalidJson(_))
        ));
        assert!(matches!(
            builder.from_payload(b"[1,2]", handle),
            Err(EnvelopeError::NotAnObject)
        ));
    }

    #[test]
    fn http_sources_merge_additively() {
        let builder = EnvelopeBuilder::new(&RequestConfig::default());
        let (handle, _reply) = RecordingReply::handle(TransportKind::Http, json!(3));
        let sources = HttpSources {
            path: "/user/get".into(),
            query: params(json!({"id": "1", "page": "2"})),
            body: params(json!({"id": 7, "name": "ant"})),
            cookies: params(json!({"name": "cookie", "session": "s"})),
            headers: params(json!({"session": "header", "host": "localhost"})),
        };

        let envelope = builder.from_http(sources, handle);
        assert_eq!(envelope.path.as_deref(), Some("/user/get"));
        assert_eq!(envelope.params["id"], json!("1"));
        assert_eq!(envelope.params["page"], json!("2"));
        assert_eq!(envelope.params["name"], json!("ant"));
        assert_eq!(envelope.params["session"], json!("s"));
        assert_eq!(envelope.params["host"], json!("localhost"));
    }

    struct KeyValueParser;

    impl PayloadParser for KeyValueParser {
        fn parse(&self, payload: &[u8]) -> Result<Params, EnvelopeError> {
            let text = String::from_utf8_lossy(payload);
            Ok(text
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                .collect())
        }
    }

    #[test]
    fn custom_parser_feeds_the_same_flags() {
        let builder = EnvelopeBuilder::new(&RequestConfig::default()).with_parser(Arc::new(KeyValueParser));
        let (handle, _reply) = RecordingReply::handle(TransportKind::Udp, json!({}));

        let envelope = builder.from_payload(b"a=user&m=get&_recv=0", handle).unwrap();
        assert_eq!(envelope.params["a"], json!("user"));
        assert!(!envelope.flags.ack_required);
        assert!(envelope.params.contains_key("_fd"));
    }

    #[test]
    fn caller_timestamp_sets_creation_time() {
        let builder = EnvelopeBuilder::new(&RequestConfig::default());
        let (handle, _reply) = RecordingReply::handle(TransportKind::Tcp, json!(1));
        let envelope = builder
            .from_payload(br#"{"_timestamp":"1000"}"#, handle)
            .unwrap();
        assert_eq!(envelope.created_at, UNIX_EPOCH + Duration::from_secs(1));
    }
}
