//! Reserved out-of-band commands.
//!
//! Raw payloads are classified once at the transport boundary. Anything that
//! is not a reserved literal continues into envelope construction untouched.

use bytes::Bytes;

pub const PING: &[u8] = b"ant-ping";
pub const PONG: &[u8] = b"ant-pong";
pub const RELOAD: &[u8] = b"ant-reload";
pub const RELOAD_ACK: &[u8] = b"ok";

pub const HTTP_PING_PATH: &str = "/ant-ping";
pub const FAVICON_PATH: &str = "/favicon.ico";

/// A raw payload after control-command interception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// An ordinary request payload.
    Data(Bytes),
    Ping,
    Reload,
}

impl ControlCommand {
    pub fn classify(payload: Bytes) -> Self {
        match payload.as_ref() {
            PING => Self::Ping,
            RELOAD => Self::Reload,
            _ => Self::Data(payload),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Data(_) => "data",
            Self::Ping => "ping",
            Self::Reload => "reload",
        }
    }
}

/// HTTP has no raw payload, so its sentinels are URL paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpSentinel {
    Ping,
    Favicon,
}

impl HttpSentinel {
    pub fn classify(path: &str) -> Option<Self> {
        match path {
            HTTP_PING_PATH => Some(Self::Ping),
            FAVICON_PATH => Some(Self::Favicon),
            _ => None,
        }
    }
}
