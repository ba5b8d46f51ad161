//! JSON-RPC 2.0 wire types
//!
//! Wire format: newline-delimited JSON (JSONL)
//! - Each message is one line
//! - UTF-8 encoded
//! - Terminated by `\n` (or `\r\n` when the worker expects it)
//!
//! Message shapes:
//! - [`Request`]: `{jsonrpc, method, params?, id}` (host → worker)
//! - [`Notification`]: `{jsonrpc, method, params?}` (either direction)
//! - [`Response`]: `{jsonrpc, id, result? | error?}` (worker → host)
//!
//! Inbound lines are classified by [`classify`] rather than by a serde tag,
//! because JSON-RPC distinguishes messages by which keys are present.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

use super::platform::LineEnding;

/// Protocol version carried in every outbound message
pub const JSONRPC_VERSION: &str = "2.0";

/// Notification the worker sends once it has finished initializing
pub const DEFAULT_READY_METHOD: &str = "agent.ready";

/// Uniform error notification (`{ "error": string }`)
pub const ERROR_METHOD: &str = "error";

/// Request/response correlation id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.to_string())
    }
}

/// Error object carried by a failed response
///
/// Code, message and data are passed through verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("worker error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Outbound request (host → worker)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub id: RequestId,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// Fire-and-forget message, no id and no reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }

    /// True for the uniform `error` notification and namespaced
    /// variants such as `agent.error`
    pub fn is_error_class(&self) -> bool {
        self.method == ERROR_METHOD || self.method.ends_with(".error")
    }

    /// Human-readable message of an error-class notification
    ///
    /// Prefers `params.error` when it is a string, then `params.message`,
    /// then the raw params rendered as JSON.
    pub fn error_message(&self) -> Option<String> {
        if !self.is_error_class() {
            return None;
        }
        let params = match &self.params {
            Some(params) => params,
            None => return Some(self.method.clone()),
        };
        let text = params
            .get("error")
            .and_then(Value::as_str)
            .or_else(|| params.get("message").and_then(Value::as_str))
            .map(str::to_string)
            .or_else(|| params.as_str().map(str::to_string))
            .unwrap_or_else(|| params.to_string());
        Some(text)
    }
}

/// Inbound response (worker → host)
///
/// `id` is `None` when the worker answered a request it could not parse.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Option<RequestId>,
    pub outcome: Result<Value, RpcError>,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            outcome: Ok(result),
        }
    }

    pub fn failure(id: RequestId, error: RpcError) -> Self {
        Self {
            id: Some(id),
            outcome: Err(error),
        }
    }

    fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        match &self.outcome {
            Ok(result) => {
                map.insert("result".into(), result.clone());
            }
            Err(error) => {
                map.insert(
                    "error".into(),
                    serde_json::to_value(error).unwrap_or(Value::Null),
                );
            }
        }
        map.insert(
            "id".into(),
            self.id
                .as_ref()
                .and_then(|id| serde_json::to_value(id).ok())
                .unwrap_or(Value::Null),
        );
        Value::Object(map)
    }
}

impl Serialize for Response {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

/// A classified inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

/// A line that could not be turned into a [`Message`]
///
/// Always recoverable: the reader logs it and moves on.
#[derive(Debug, Error)]
pub enum MalformedMessage {
    #[error("invalid JSON: {source} (line: {line})")]
    InvalidJson {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    #[error("unrecognized message shape: {line}")]
    UnrecognizedShape { line: String },

    #[error("invalid `{field}` field: {line}")]
    InvalidField { field: &'static str, line: String },

    #[error("line exceeds {limit} bytes and was discarded")]
    Oversized { limit: usize },
}

impl MalformedMessage {
    /// The offending line, when it is known
    pub fn line(&self) -> Option<&str> {
        match self {
            MalformedMessage::InvalidJson { line, .. }
            | MalformedMessage::UnrecognizedShape { line }
            | MalformedMessage::InvalidField { line, .. } => Some(line),
            MalformedMessage::InvalidUtf8 | MalformedMessage::Oversized { .. } => None,
        }
    }
}

/// Decode one complete line (without its terminator) into a message
pub fn decode_line(line: &[u8]) -> Result<Message, MalformedMessage> {
    let text = std::str::from_utf8(line).map_err(|_| MalformedMessage::InvalidUtf8)?;
    let text = text.trim();
    let value: Value =
        serde_json::from_str(text).map_err(|source| MalformedMessage::InvalidJson {
            line: text.to_string(),
            source,
        })?;
    classify(value).map_err(|e| match e {
        Shape::Unrecognized => MalformedMessage::UnrecognizedShape {
            line: text.to_string(),
        },
        Shape::BadField(field) => MalformedMessage::InvalidField {
            field,
            line: text.to_string(),
        },
    })
}

/// Why a decoded value did not match a message shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Unrecognized,
    BadField(&'static str),
}

/// Classify a decoded JSON value by the keys it carries
///
/// - `id` plus `result` or `error` → [`Message::Response`]
/// - `method` without `id` → [`Message::Notification`]
/// - `method` with `id` → [`Message::Request`]
pub fn classify(value: Value) -> Result<Message, Shape> {
    let mut map = match value {
        Value::Object(map) => map,
        _ => return Err(Shape::Unrecognized),
    };

    let has_id = map.contains_key("id");
    let is_response = has_id && (map.contains_key("result") || map.contains_key("error"));

    if is_response {
        let id = match map.remove("id") {
            Some(Value::Null) | None => None,
            Some(raw) => Some(
                serde_json::from_value::<RequestId>(raw).map_err(|_| Shape::BadField("id"))?,
            ),
        };
        // Workers may send both keys with one of them null; a non-null
        // error always wins.
        let error = match map.remove("error") {
            Some(Value::Null) | None => None,
            Some(raw) => Some(
                serde_json::from_value::<RpcError>(raw).map_err(|_| Shape::BadField("error"))?,
            ),
        };
        let outcome = match error {
            Some(error) => Err(error),
            None => Ok(map.remove("result").unwrap_or(Value::Null)),
        };
        return Ok(Message::Response(Response { id, outcome }));
    }

    let method = match map.remove("method") {
        Some(Value::String(method)) => method,
        Some(_) => return Err(Shape::BadField("method")),
        None => return Err(Shape::Unrecognized),
    };
    let params = match map.remove("params") {
        Some(Value::Null) | None => None,
        Some(params) => Some(params),
    };

    match map.remove("id") {
        Some(Value::Null) | None => Ok(Message::Notification(Notification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method,
            params,
        })),
        Some(raw) => {
            let id = serde_json::from_value::<RequestId>(raw).map_err(|_| Shape::BadField("id"))?;
            Ok(Message::Request(Request {
                jsonrpc: JSONRPC_VERSION.to_string(),
                method,
                params,
                id,
            }))
        }
    }
}

/// Encode a message as one JSONL line, terminator included
pub fn encode_line<T: Serialize>(message: &T, ending: LineEnding) -> serde_json::Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.extend_from_slice(ending.as_bytes());
    Ok(bytes)
}
