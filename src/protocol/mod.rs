//! JSON-RPC 2.0 protocol types shared by every transport.

pub mod frame;

pub use frame::{
    decode, encode, BatchElement, DecodeFailure, InboundFrame, JsonRpcId, JsonRpcResponse,
    OutboundFrame, ParsedRequest, ResponsePayload, JSONRPC_VERSION,
};

/// MCP protocol versions this server negotiates.
///
/// An `initialize` request carrying any other version falls back to the
/// first entry.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26"];
