//! JSON-RPC 2.0 error response structures.

use serde::{Deserialize, Serialize};

/// JSON-RPC 2.0 error object.
///
/// Embedded in error responses. `code` is one of the canonical codes
/// produced by [`crate::error::BridgeError::to_jsonrpc_code`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code (standard JSON-RPC or toolbridge-specific)
    pub code: i32,

    /// Human-readable error message
    pub message: String,

    /// Additional error data (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ErrorData>,
}

/// Additional error context data.
///
/// All fields are safe for client consumption: no stack traces, no
/// internal addresses, no secrets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    /// Unique identifier for tracing this error in logs
    pub correlation_id: String,

    /// Machine-readable error type name
    pub error_type: String,

    /// Tool name involved, where applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,

    /// Failure kind within the tool (declared error vs uncaught), where applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Type-specific error details (sanitized)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Suggested retry delay in seconds (for retriable errors)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}
