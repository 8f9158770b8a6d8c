use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::{AdapterError, NetworkError, QueueError};

/// Wire protocol version expected in every frame.
pub const PROTOCOL_VERSION: &str = "2.0";

/// JSON-RPC error code for unparseable frames.
pub const PARSE_ERROR: i64 = -32700;
/// JSON-RPC error code for structurally invalid requests.
pub const INVALID_REQUEST: i64 = -32600;
/// JSON-RPC error code for unknown methods.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC error code for invalid parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// JSON-RPC error code for internal failures.
pub const INTERNAL_ERROR: i64 = -32603;

/// One inbound request or one-way client notification.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Option<Value>,
}

/// Typed failure produced while dispatching one request.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("parse error: {reason}")]
    Parse { reason: String },
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("method `{method}` not found")]
    MethodNotFound { method: String },
    #[error("invalid params: {reason}")]
    InvalidParams { reason: String },
    #[error("{message}")]
    Internal { message: String },
}

impl RpcError {
    /// Convenience constructor for internal failures.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Convenience constructor for parameter validation failures.
    pub fn invalid_params(reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            reason: reason.into(),
        }
    }

    /// Returns the wire error code for this failure.
    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            Self::Parse { .. } => PARSE_ERROR,
            Self::InvalidRequest { .. } => INVALID_REQUEST,
            Self::MethodNotFound { .. } => METHOD_NOT_FOUND,
            Self::InvalidParams { .. } => INVALID_PARAMS,
            Self::Internal { .. } => INTERNAL_ERROR,
        }
    }
}

impl From<AdapterError> for RpcError {
    fn from(error: AdapterError) -> Self {
        Self::internal(error.to_string())
    }
}

impl From<NetworkError> for RpcError {
    fn from(error: NetworkError) -> Self {
        Self::internal(error.to_string())
    }
}

impl From<QueueError> for RpcError {
    fn from(error: QueueError) -> Self {
        Self::internal(error.to_string())
    }
}

/// Error object carried inside an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl From<&RpcError> for RpcErrorObject {
    fn from(error: &RpcError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
            data: None,
        }
    }
}

/// Parses one text frame into a request.
///
/// # Errors
///
/// Returns a parse error when the frame is not JSON, and an invalid-request
/// error when the version or method fields do not match the protocol.
pub fn parse_frame(text: &str) -> Result<RpcRequest, RpcError> {
    let request: RpcRequest = serde_json::from_str(text).map_err(|error| RpcError::Parse {
        reason: error.to_string(),
    })?;

    if request.jsonrpc != PROTOCOL_VERSION {
        return Err(RpcError::InvalidRequest {
            reason: format!("unsupported version `{}`", request.jsonrpc),
        });
    }
    if request.method.as_deref().unwrap_or("").is_empty() {
        return Err(RpcError::InvalidRequest {
            reason: "missing method".to_owned(),
        });
    }

    Ok(request)
}

/// Serialises a success response frame.
#[must_use]
pub fn result_frame(id: &Value, result: Value) -> String {
    serde_json::json!({
        "jsonrpc": PROTOCOL_VERSION,
        "result": result,
        "id": id,
    })
    .to_string()
}

/// Serialises an error response frame. A `None` id renders as `null`,
/// matching the envelope used for parse errors.
#[must_use]
pub fn error_frame(id: Option<&Value>, error: &RpcError) -> String {
    serde_json::json!({
        "jsonrpc": PROTOCOL_VERSION,
        "error": RpcErrorObject::from(error),
        "id": id,
    })
    .to_string()
}

/// Serialises a one-way server notification frame.
#[must_use]
pub fn notification_frame(method: &str, params: Value) -> String {
    serde_json::json!({
        "jsonrpc": PROTOCOL_VERSION,
        "method": method,
        "params": params,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn parse_frame_accepts_a_plain_request() {
        let request = parse_frame(r#"{"jsonrpc":"2.0","method":"devices.enumerate","id":7}"#)
            .expect("well-formed frame should parse");
        assert_eq!(Some("devices.enumerate"), request.method.as_deref());
        assert_eq!(Some(serde_json::json!(7)), request.id);
    }

    #[test]
    fn parse_frame_rejects_garbage_as_parse_error() {
        let result = parse_frame("\u{1}\u{2}not json");
        assert_matches!(result, Err(RpcError::Parse { .. }));
    }

    #[rstest]
    #[case(r#"{"jsonrpc":"1.0","method":"devices.enumerate"}"#)]
    #[case(r#"{"method":"devices.enumerate"}"#)]
    #[case(r#"{"jsonrpc":"2.0","params":{}}"#)]
    fn parse_frame_rejects_invalid_requests(#[case] frame: &str) {
        let result = parse_frame(frame);
        assert_matches!(result, Err(RpcError::InvalidRequest { .. }));
    }

    #[test]
    fn error_frame_renders_null_id_for_parse_errors() {
        let error = RpcError::Parse {
            reason: "bad".to_owned(),
        };
        let frame = error_frame(None, &error);
        let value: serde_json::Value = serde_json::from_str(&frame).expect("frame is JSON");
        assert_eq!(serde_json::Value::Null, value["id"]);
        assert_eq!(PARSE_ERROR, value["error"]["code"]);
    }

    #[test]
    fn platform_errors_surface_the_adapter_message() {
        let error: RpcError = crate::error::AdapterError::UnsupportedOnPlatform {
            operation: "usb.sendReport".to_owned(),
        }
        .into();
        assert_eq!(INTERNAL_ERROR, error.code());
        assert_eq!(
            "usb.sendReport is not available on this platform",
            error.to_string()
        );
    }
}
