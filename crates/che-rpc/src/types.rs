//! JSON-RPC 2.0 frames.

use che_core::constants::JSONRPC_VERSION;
use serde::Serialize;
use serde_json::Value;

/// Outbound request.
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Correlation id.
    pub id: &'a str,
    /// Method name.
    pub method: &'a str,
    /// Parameters, omitted when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

impl<'a> Request<'a> {
    /// Build a request frame.
    pub fn new(id: &'a str, method: &'a str, params: Option<&'a Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

/// Outbound notification (no id, no response).
#[derive(Debug, Serialize)]
pub struct Notification<'a> {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Method name.
    pub method: &'a str,
    /// Parameters, omitted when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

impl<'a> Notification<'a> {
    /// Build a notification frame.
    pub fn new(method: &'a str, params: Option<&'a Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

/// How the body of an inbound response settles its request.
#[derive(Debug, PartialEq)]
pub enum Outcome<'a> {
    /// `result` key present, possibly `null`.
    Result(&'a Value),
    /// `error` key present.
    Error(&'a Value),
    /// Neither key present.
    Empty,
}

/// Inbound id as a string. Numeric ids are stringified.
pub fn message_id(message: &Value) -> Option<String> {
    match message.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Inbound method name, for notifications.
pub fn message_method(message: &Value) -> Option<&str> {
    message.get("method").and_then(Value::as_str)
}

/// Classify a response body. Presence of `result` wins over `error`.
pub fn outcome(message: &Value) -> Outcome<'_> {
    if let Some(result) = message.get("result") {
        Outcome::Result(result)
    } else if let Some(error) = message.get("error") {
        Outcome::Error(error)
    } else {
        Outcome::Empty
    }
}
