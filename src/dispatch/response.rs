//! Response envelope shared by all transports.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::dispatch::task::TaskId;

pub const CODE_OK: i64 = 0;
pub const CODE_BAD_REQUEST: i64 = 400;
pub const CODE_NOT_FOUND: i64 = 404;
pub const CODE_INTERNAL: i64 = 500;
pub const CODE_UNAVAILABLE: i64 = 503;

/// `{"code": int, "msg": string, "data": any}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub code: i64,
    pub msg: String,
    pub data: Value,
}

impl ResponseEnvelope {
    /// The acknowledgement sent when the caller does not wait for a result.
    pub fn empty() -> Self {
        Self::success(Value::Null)
    }

    pub fn success(data: Value) -> Self {
        Self {
            code: CODE_OK,
            msg: String::new(),
            data,
        }
    }

    pub fn task_accepted(task_id: &TaskId) -> Self {
        Self::success(json!({ "taskId": task_id.as_str() }))
    }

    pub fn error(code: i64, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data: Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == CODE_OK
    }

    pub fn to_bytes(&self) -> Bytes {
        match serde_json::to_vec(self) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                tracing::error!(error = %e, code = self.code, "Failed to serialize response");
                Bytes::from_static(br#"{"code":500,"msg":"response serialization failed","data":null}"#)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_envelope_wire_form() {
        assert_eq!(
            ResponseEnvelope::empty().to_bytes(),
            Bytes::from_static(br#"{"code":0,"msg":"","data":null}"#)
        );
    }

    #[test]
    fn task_ack_carries_only_the_id() {
        let id = TaskId::generate("worker-0");
        let ack = ResponseEnvelope::task_accepted(&id);
        assert!(ack.is_success());
        assert_eq!(ack.data, json!({ "taskId": id.as_str() }));
    }
}
