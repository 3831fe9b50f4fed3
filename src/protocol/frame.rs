//! JSON-RPC 2.0 frame codec.
//!
//! Decodes wire bytes into validated request frames and serializes
//! response frames back out. All three transports share this codec.
//!
//! # JSON-RPC 2.0 Compliance
//!
//! - Requests have `id`, `method`, and optional `params`
//! - Notifications are requests without `id`
//! - Batches are arrays of requests/notifications; element-level failures
//!   become per-element error responses with `id: null`
//! - `id` type (string or integer) is preserved exactly in responses
//!
//! # Security Note
//!
//! This module parses untrusted input. Size limits are enforced at the
//! transport layer before bytes reach `decode`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::jsonrpc::JsonRpcError;
use crate::error::BridgeError;

/// JSON-RPC 2.0 version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request ID.
///
/// The wire format allows string, integer, or null IDs. The exact type is
/// preserved so responses echo the same type: if the client sends
/// `"id": 1`, the response carries `"id": 1`, never `"id": "1"`.
///
/// `Null` is an explicit `"id": null` (valid but unusual); a *missing*
/// `id` field means the message is a notification and is represented as
/// `None` at the [`ParsedRequest`] level instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JsonRpcId {
    /// Integer ID (e.g., `"id": 1`)
    Number(i64),
    /// String ID (e.g., `"id": "abc-123"`)
    String(String),
    /// Explicit null ID
    Null,
}

impl Serialize for JsonRpcId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JsonRpcId::Number(n) => serializer.serialize_i64(*n),
            JsonRpcId::String(s) => serializer.serialize_str(s),
            JsonRpcId::Null => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for JsonRpcId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::Number(n) => n.as_i64().map(JsonRpcId::Number).ok_or_else(|| {
                serde::de::Error::custom("JSON-RPC ID must be integer, not float")
            }),
            Value::String(s) => Ok(JsonRpcId::String(s)),
            Value::Null => Ok(JsonRpcId::Null),
            _ => Err(serde::de::Error::custom(
                "JSON-RPC ID must be string, integer, or null",
            )),
        }
    }
}

/// Salvage an ID from a raw JSON object for error responses.
///
/// Returns the ID when present and of a valid type, `Null` otherwise.
fn salvage_id(value: &Value) -> JsonRpcId {
    match value.get("id") {
        Some(Value::Number(n)) => n.as_i64().map(JsonRpcId::Number).unwrap_or(JsonRpcId::Null),
        Some(Value::String(s)) => JsonRpcId::String(s.clone()),
        _ => JsonRpcId::Null,
    }
}

/// Maximum client-requested timeout: 24 hours in milliseconds.
/// Larger values are clamped rather than rejected.
const MAX_CLIENT_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// Parsed and validated JSON-RPC request with internal tracking.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    /// Original JSON-RPC ID (`None` for notifications)
    pub id: Option<JsonRpcId>,
    /// Method name
    pub method: String,
    /// Method parameters
    pub params: Option<Value>,
    /// Client-requested timeout from `params._meta.timeoutMs`, clamped
    pub client_timeout: Option<Duration>,
    /// Timestamp when the frame was decoded
    pub received_at: Instant,
    /// Unique correlation ID for tracing
    pub correlation_id: Uuid,
}

impl ParsedRequest {
    /// Returns true if this is a notification (no ID).
    ///
    /// Notifications never receive responses, regardless of outcome.
    #[inline]
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Re-serialize to the wire representation.
    pub fn to_wire(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("jsonrpc".into(), Value::String(JSONRPC_VERSION.into()));
        if let Some(id) = &self.id {
            obj.insert("id".into(), serde_json::to_value(id).unwrap_or(Value::Null));
        }
        obj.insert("method".into(), Value::String(self.method.clone()));
        if let Some(params) = &self.params {
            obj.insert("params".into(), params.clone());
        }
        Value::Object(obj)
    }
}

/// JSON-RPC 2.0 response frame.
///
/// Carries exactly one of `result` or `error`; the custom `Serialize`
/// impl guarantees the two are never emitted together and that a null
/// `result` is emitted as `"result": null` rather than omitted.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    /// Request ID being answered (`Null` when the ID was unparseable)
    pub id: JsonRpcId,
    /// Response payload
    pub payload: ResponsePayload,
}

/// The result-or-error payload of a response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    /// Successful result (any JSON value, including null)
    Result(Value),
    /// Error object
    Error(JsonRpcError),
}

impl JsonRpcResponse {
    /// Create a success response.
    pub fn success(id: JsonRpcId, result: Value) -> Self {
        Self {
            id,
            payload: ResponsePayload::Result(result),
        }
    }

    /// Create an error response.
    pub fn error(id: JsonRpcId, error: JsonRpcError) -> Self {
        Self {
            id,
            payload: ResponsePayload::Error(error),
        }
    }

    /// Returns the error object if this is an error response.
    pub fn error_ref(&self) -> Option<&JsonRpcError> {
        match &self.payload {
            ResponsePayload::Error(e) => Some(e),
            ResponsePayload::Result(_) => None,
        }
    }
}

impl Serialize for JsonRpcResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        map.serialize_entry("id", &self.id)?;
        match &self.payload {
            ResponsePayload::Result(v) => map.serialize_entry("result", v)?,
            ResponsePayload::Error(e) => map.serialize_entry("error", e)?,
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for JsonRpcResponse {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let obj = value
            .as_object()
            .ok_or_else(|| serde::de::Error::custom("response must be an object"))?;
        let id = match obj.get("id") {
            Some(v) => JsonRpcId::deserialize(v.clone()).map_err(serde::de::Error::custom)?,
            None => return Err(serde::de::Error::custom("response missing id")),
        };
        match (obj.get("result"), obj.get("error")) {
            (Some(result), None) => Ok(JsonRpcResponse::success(id, result.clone())),
            (None, Some(error)) => {
                let error: JsonRpcError =
                    serde_json::from_value(error.clone()).map_err(serde::de::Error::custom)?;
                Ok(JsonRpcResponse::error(id, error))
            }
            _ => Err(serde::de::Error::custom(
                "response must carry exactly one of result or error",
            )),
        }
    }
}

/// One element of a decoded batch.
#[derive(Debug)]
pub enum BatchElement {
    /// A well-formed request or notification
    Request(ParsedRequest),
    /// A malformed element; answered with an `id: null` error response
    Invalid(BridgeError),
}

/// A decoded inbound frame.
#[derive(Debug)]
pub enum InboundFrame {
    /// A single request or notification
    Single(ParsedRequest),
    /// A batch of one or more elements
    Batch(Vec<BatchElement>),
}

/// An outbound response frame.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    /// Response to a single request
    Single(JsonRpcResponse),
    /// Responses to the non-notification members of a batch
    Batch(Vec<JsonRpcResponse>),
}

/// A whole-frame decode failure.
///
/// Carries the ID salvaged from the raw input (Null when none could be
/// recovered) so the error response echoes it.
#[derive(Debug)]
pub struct DecodeFailure {
    /// ID for the error response
    pub id: JsonRpcId,
    /// The protocol error
    pub error: BridgeError,
}

/// Decode wire bytes into a frame.
///
/// # Errors
///
/// Returns [`DecodeFailure`] for failures that abort the whole frame:
/// invalid JSON (-32700), a non-object/non-array top level, an empty
/// batch, or a shape-invalid single request (-32600). Shape failures
/// inside a non-empty batch do *not* abort the frame; they surface as
/// [`BatchElement::Invalid`].
pub fn decode(bytes: &[u8]) -> Result<InboundFrame, DecodeFailure> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| DecodeFailure {
        id: JsonRpcId::Null,
        error: BridgeError::ParseError {
            details: format!("invalid JSON: {}", e),
        },
    })?;

    match value {
        Value::Array(elements) => {
            if elements.is_empty() {
                return Err(DecodeFailure {
                    id: JsonRpcId::Null,
                    error: BridgeError::InvalidRequest {
                        details: "empty batch".to_string(),
                    },
                });
            }
            let decoded = elements
                .into_iter()
                .map(|element| match decode_single(element) {
                    Ok(req) => BatchElement::Request(req),
                    Err((_, error)) => BatchElement::Invalid(error),
                })
                .collect();
            Ok(InboundFrame::Batch(decoded))
        }
        Value::Object(_) => match decode_single(value) {
            Ok(req) => Ok(InboundFrame::Single(req)),
            Err((id, error)) => Err(DecodeFailure { id, error }),
        },
        _ => Err(DecodeFailure {
            id: JsonRpcId::Null,
            error: BridgeError::InvalidRequest {
                details: "request must be an object or array".to_string(),
            },
        }),
    }
}

/// Serialize an outbound frame to bytes.
pub fn encode(frame: &OutboundFrame) -> Vec<u8> {
    // Responses are built from values that already serialized once;
    // serialization cannot fail on them.
    serde_json::to_vec(frame).unwrap_or_else(|_| {
        br#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Internal error"}}"#
            .to_vec()
    })
}

/// Decode and validate one request object.
///
/// On failure returns the salvaged ID (for single-request error
/// responses) alongside the error.
fn decode_single(value: Value) -> Result<ParsedRequest, (JsonRpcId, BridgeError)> {
    let fallback_id = salvage_id(&value);
    let invalid = |details: String| BridgeError::InvalidRequest { details };

    let obj = match value {
        Value::Object(obj) => obj,
        _ => {
            return Err((
                JsonRpcId::Null,
                invalid("batch element must be an object".to_string()),
            ))
        }
    };

    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => {}
        Some(other) => {
            return Err((
                fallback_id,
                invalid(format!("unsupported jsonrpc version \"{}\"", other)),
            ))
        }
        None => {
            return Err((
                fallback_id,
                invalid("missing required field: jsonrpc".to_string()),
            ))
        }
    }

    let id = match obj.get("id") {
        None => None,
        Some(Value::Null) => Some(JsonRpcId::Null),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => Some(JsonRpcId::Number(i)),
            None => {
                return Err((
                    JsonRpcId::Null,
                    invalid("id must be an integer, not a float".to_string()),
                ))
            }
        },
        Some(Value::String(s)) => Some(JsonRpcId::String(s.clone())),
        Some(_) => {
            return Err((
                JsonRpcId::Null,
                invalid("id must be a string, integer, or null".to_string()),
            ))
        }
    };

    let method = match obj.get("method") {
        Some(Value::String(m)) if !m.is_empty() => m.clone(),
        Some(Value::String(_)) => {
            return Err((fallback_id, invalid("method must be non-empty".to_string())))
        }
        Some(_) => {
            return Err((fallback_id, invalid("method must be a string".to_string())))
        }
        None => {
            return Err((
                fallback_id,
                invalid("missing required field: method".to_string()),
            ))
        }
    };

    let params = match obj.get("params") {
        None => None,
        Some(p @ (Value::Object(_) | Value::Array(_))) => Some(p.clone()),
        Some(_) => {
            return Err((
                fallback_id,
                invalid("params must be an object or array".to_string()),
            ))
        }
    };

    let client_timeout = extract_client_timeout(params.as_ref());

    Ok(ParsedRequest {
        id,
        method,
        params,
        client_timeout,
        received_at: Instant::now(),
        correlation_id: Uuid::new_v4(),
    })
}

/// Extract the client-requested timeout from `params._meta.timeoutMs`.
///
/// Values above [`MAX_CLIENT_TIMEOUT_MS`] are clamped.
fn extract_client_timeout(params: Option<&Value>) -> Option<Duration> {
    params?
        .get("_meta")?
        .get("timeoutMs")?
        .as_u64()
        .map(|ms| Duration::from_millis(ms.min(MAX_CLIENT_TIMEOUT_MS)))
}
