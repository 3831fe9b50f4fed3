//! toolbridge - MCP tool server core.
//!
//! Accepts JSON-RPC 2.0 over three concurrent transports and dispatches
//! requests to a registry of named tools on behalf of AI agents
//! (notably n8n's MCP Client node).
//!
//! # Transports
//!
//! - **HTTP** (`POST /rpc`): one request body, one response body.
//! - **WebSocket** (`/ws`): bidirectional frames with server pings.
//! - **SSE + POST** (`GET /sse` + `POST /messages`): legacy
//!   n8n-compatible event-stream framing with session binding.
//!
//! # Dispatch pipeline
//!
//! ```text
//! transport -> frame codec -> middleware chain -> dispatcher
//!           -> tool registry -> ToolModule::call -> response
//! ```
//!
//! Concrete tools live behind the [`registry::ToolModule`] trait; the
//! core never interprets what a tool does.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod metrics;
pub mod middleware;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;
