//! Error handling for toolbridge.
//!
//! This module defines every error the core raises and its mapping to a
//! JSON-RPC 2.0 error response.
//!
//! # Error code map
//!
//! | Condition | Code |
//! |-----------|------|
//! | Malformed JSON | -32700 |
//! | Shape-invalid request | -32600 |
//! | Unknown method / unknown tool | -32601 |
//! | Invalid params / schema failure | -32602 |
//! | Internal error (uncaught) | -32603 |
//! | Unauthorized | -32001 |
//! | Tool execution failed | -32002 |
//! | Request timeout | -32003 |
//! | Backpressure / overloaded | -32004 |
//! | Cancelled | -32005 |
//!
//! Connection-level failures (non-JSON bodies on the wrong endpoint,
//! oversize bodies, unknown sessions) are handled by the transports with
//! HTTP status codes and never surface as JSON-RPC errors.

pub mod jsonrpc;

use jsonrpc::{ErrorData, JsonRpcError};
use thiserror::Error;

/// All error types the dispatch core can produce.
///
/// Each variant maps to exactly one canonical JSON-RPC error code and
/// carries only fields that are safe to expose through `safe_details`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BridgeError {
    // Protocol errors
    /// Invalid JSON in a request body or frame.
    #[error("Parse error")]
    ParseError {
        /// Description of the parse failure
        details: String,
    },

    /// Message is not a valid JSON-RPC 2.0 request.
    #[error("Invalid Request")]
    InvalidRequest {
        /// What makes the request invalid
        details: String,
    },

    /// The requested method or tool does not exist.
    #[error("Method not found")]
    MethodNotFound {
        /// The method that was not found
        method: String,
        /// The tool name, when the failure was a tools/call lookup
        tool: Option<String>,
    },

    /// Method parameters failed validation.
    #[error("Invalid params")]
    InvalidParams {
        /// Violation list from the validator
        violations: Vec<String>,
    },

    /// Uncaught failure inside the server or a tool.
    #[error("Internal error")]
    Internal {
        /// Correlation ID for log lookup
        correlation_id: String,
    },

    // Security
    /// Credential missing or rejected by the configured authenticator.
    #[error("Unauthorized")]
    Unauthorized,

    // Execution
    /// A tool returned a declared error.
    #[error("Tool execution failed")]
    ToolExecution {
        /// The tool that failed
        tool: String,
        /// Declared failure kind
        kind: String,
        /// Tool-provided message (already client-safe by contract)
        message: String,
    },

    // Capacity
    /// The request deadline elapsed before the tool finished.
    #[error("Request timeout")]
    Timeout {
        /// The tool that timed out, if the request reached one
        tool: Option<String>,
        /// Deadline in milliseconds
        deadline_ms: u64,
    },

    /// All dispatch slots and the wait queue are full.
    #[error("Server busy")]
    ServerBusy,

    // Control
    /// The request was cancelled (client disconnect, drain, or explicit cancel).
    #[error("Cancelled")]
    Cancelled,
}

impl BridgeError {
    /// Maps the error to its canonical JSON-RPC 2.0 code.
    pub fn to_jsonrpc_code(&self) -> i32 {
        match self {
            Self::ParseError { .. } => -32700,
            Self::InvalidRequest { .. } => -32600,
            Self::MethodNotFound { .. } => -32601,
            Self::InvalidParams { .. } => -32602,
            Self::Internal { .. } => -32603,
            Self::Unauthorized => -32001,
            Self::ToolExecution { .. } => -32002,
            Self::Timeout { .. } => -32003,
            Self::ServerBusy => -32004,
            Self::Cancelled => -32005,
        }
    }

    /// Returns the error type name for metrics and logging.
    pub fn error_type_name(&self) -> &'static str {
        match self {
            Self::ParseError { .. } => "parse_error",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::MethodNotFound { .. } => "method_not_found",
            Self::InvalidParams { .. } => "invalid_params",
            Self::Internal { .. } => "internal_error",
            Self::Unauthorized => "unauthorized",
            Self::ToolExecution { .. } => "tool_execution_failed",
            Self::Timeout { .. } => "request_timeout",
            Self::ServerBusy => "server_busy",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns the tool name associated with this error, if any.
    pub fn tool(&self) -> Option<&str> {
        match self {
            Self::ToolExecution { tool, .. } => Some(tool),
            Self::MethodNotFound { tool, .. } => tool.as_deref(),
            Self::Timeout { tool, .. } => tool.as_deref(),
            _ => None,
        }
    }

    /// Returns the tool failure kind, if any.
    pub fn kind(&self) -> Option<&str> {
        match self {
            Self::ToolExecution { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Returns a retry-after hint in seconds for retriable errors.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::ServerBusy => Some(1),
            _ => None,
        }
    }

    /// Returns details safe for client consumption.
    ///
    /// Parse and shape errors expose the parser message (it describes the
    /// client's own input). Internal errors expose nothing beyond the
    /// correlation id already present in `ErrorData`.
    pub fn safe_details(&self) -> Option<serde_json::Value> {
        match self {
            Self::ParseError { details } => Some(serde_json::json!(details)),
            Self::InvalidRequest { details } => Some(serde_json::json!(details)),
            Self::MethodNotFound { method, .. } => {
                Some(serde_json::json!(format!("Method: {}", method)))
            }
            Self::InvalidParams { violations } => Some(serde_json::json!(violations)),
            Self::ToolExecution { message, .. } => Some(serde_json::json!(message)),
            Self::Timeout { deadline_ms, .. } => {
                Some(serde_json::json!(format!("Deadline: {}ms", deadline_ms)))
            }
            Self::Internal { .. }
            | Self::Unauthorized
            | Self::ServerBusy
            | Self::Cancelled => None,
        }
    }

    /// Converts the error into a JSON-RPC error object.
    pub fn to_jsonrpc_error(&self, correlation_id: &str) -> JsonRpcError {
        JsonRpcError {
            code: self.to_jsonrpc_code(),
            message: self.to_string(),
            data: Some(ErrorData {
                correlation_id: correlation_id.to_string(),
                error_type: self.error_type_name().to_string(),
                tool: self.tool().map(String::from),
                kind: self.kind().map(String::from),
                details: self.safe_details(),
                retry_after: self.retry_after(),
            }),
        }
    }
}
