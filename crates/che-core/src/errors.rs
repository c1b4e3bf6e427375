//! Wire-level error types.
//!
//! A JSON-RPC error response carries `{number, message, data?}`. Servers
//! following the JSON-RPC 2.0 letter use `code` instead of `number`; both
//! spellings deserialize into [`RpcErrorPayload`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Standard codes
// ─────────────────────────────────────────────────────────────────────────────

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32_700;
/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32_600;
/// The method does not exist or is not available.
pub const METHOD_NOT_FOUND: i64 = -32_601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32_602;
/// Internal JSON-RPC error.
pub const INTERNAL_ERROR: i64 = -32_603;

// ─────────────────────────────────────────────────────────────────────────────
// Payload
// ─────────────────────────────────────────────────────────────────────────────

/// Error body of a JSON-RPC response.
#[derive(Clone, Debug, PartialEq, Error, Serialize, Deserialize)]
#[error("[{number}] {message}")]
pub struct RpcErrorPayload {
    /// Numeric error code.
    #[serde(alias = "code")]
    pub number: i64,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorPayload {
    /// Build a payload without data.
    #[must_use]
    pub fn new(number: i64, message: impl Into<String>) -> Self {
        Self {
            number,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Decode an `error` member of a response.
    ///
    /// Malformed bodies (a bare string, a missing code) still produce a
    /// payload so the caller's future is always rejected rather than left
    /// pending.
    #[must_use]
    pub fn from_wire(value: &Value) -> Self {
        if let Ok(payload) = serde_json::from_value::<Self>(value.clone()) {
            return payload;
        }
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| value.as_str())
            .unwrap_or("malformed error response")
            .to_owned();
        Self {
            number: INTERNAL_ERROR,
            message,
            data: Some(value.clone()),
        }
    }
}
