//! Connection and session registry.
//!
//! Tracks every live transport attachment, binds SSE sessions to their
//! streams, and coordinates graceful drain. This is one of the two
//! pieces of process-wide mutable state (the other is the tool
//! registry): reads are concurrent, close/drain transitions are
//! idempotent.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::JSONRPC_VERSION;

/// Which transport a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    Ws,
    Sse,
}

impl TransportKind {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Ws => "ws",
            Self::Sse => "sse",
        }
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepting inbound frames
    Open,
    /// No new inbound frames; owed responses still flushed
    Draining,
    /// Fully closed
    Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// One event on an SSE stream, pre-rendered name + single-line data.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    /// Event name (`endpoint`, `message`, `ping`, `close`)
    pub event: String,
    /// Single-line JSON (or path) payload
    pub data: String,
}

impl SseEvent {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}

/// Where server-initiated frames for a connection go.
pub enum OutboundSink {
    /// HTTP is one-shot; the response travels back in-band.
    Http,
    /// WebSocket text frames.
    Ws(mpsc::Sender<String>),
    /// SSE named events.
    Sse(mpsc::Sender<SseEvent>),
}

/// One live transport attachment.
pub struct Connection {
    /// Server-generated id, unique for the process lifetime
    pub id: Uuid,
    /// Originating transport
    pub transport: TransportKind,
    /// Peer address when known
    pub remote_addr: Option<SocketAddr>,
    /// Accept timestamp
    pub opened_at: Instant,
    /// Fires when the connection closes; child tokens cancel in-flight requests
    pub cancel: CancellationToken,
    /// Per-connection dispatch slots
    pub inflight: Arc<Semaphore>,
    /// Correlation ids of requests in flight on this connection
    pending: DashSet<Uuid>,
    /// Outbound sink for server-initiated frames
    outbound: OutboundSink,
    state: AtomicU8,
    /// SSE session bound to this connection, if any
    session_id: once_cell::sync::OnceCell<String>,
}

impl Connection {
    /// Current state.
    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => ConnectionState::Open,
            STATE_DRAINING => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }

    /// Whether new inbound frames are accepted.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Track a request in flight on this connection.
    pub fn track_request(&self, correlation_id: Uuid) {
        self.pending.insert(correlation_id);
    }

    /// Remove a finished request.
    pub fn finish_request(&self, correlation_id: Uuid) {
        self.pending.remove(&correlation_id);
    }

    /// Number of requests currently in flight.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send a server-initiated notification over a streaming sink.
    ///
    /// Returns false when the sink is gone or the transport cannot carry
    /// server-initiated frames (HTTP).
    pub fn send_notification(&self, method: &str, params: Value) -> bool {
        let frame = serde_json::json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": method,
            "params": params,
        });
        match &self.outbound {
            OutboundSink::Http => false,
            OutboundSink::Ws(tx) => tx.try_send(frame.to_string()).is_ok(),
            OutboundSink::Sse(tx) => tx
                .try_send(SseEvent::new("message", frame.to_string()))
                .is_ok(),
        }
    }

    /// The SSE sink, when this is an SSE connection.
    pub fn sse_sink(&self) -> Option<mpsc::Sender<SseEvent>> {
        match &self.outbound {
            OutboundSink::Sse(tx) => Some(tx.clone()),
            _ => None,
        }
    }

    /// The WebSocket sink, when this is a WS connection.
    pub fn ws_sink(&self) -> Option<mpsc::Sender<String>> {
        match &self.outbound {
            OutboundSink::Ws(tx) => Some(tx.clone()),
            _ => None,
        }
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// The process-wide connection and session registry.
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, Arc<Connection>>,
    /// session id -> connection id (SSE only)
    sessions: DashMap<String, Uuid>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    /// Register a new connection.
    ///
    /// `per_connection_limit` sizes the connection's dispatch slots (1
    /// for HTTP, the configured streaming limit for WS/SSE).
    pub fn open(
        &self,
        transport: TransportKind,
        remote_addr: Option<SocketAddr>,
        outbound: OutboundSink,
        per_connection_limit: usize,
    ) -> Arc<Connection> {
        let connection = Arc::new(Connection {
            id: Uuid::new_v4(),
            transport,
            remote_addr,
            opened_at: Instant::now(),
            cancel: CancellationToken::new(),
            inflight: Arc::new(Semaphore::new(per_connection_limit)),
            pending: DashSet::new(),
            outbound,
            state: AtomicU8::new(STATE_OPEN),
            session_id: once_cell::sync::OnceCell::new(),
        });
        self.connections.insert(connection.id, connection.clone());
        debug!(
            connection_id = %connection.id,
            transport = transport.as_str(),
            "Connection opened"
        );
        connection
    }

    /// Issue a session id bound to an SSE connection.
    ///
    /// A session owns exactly one connection; the binding lives until
    /// the connection closes.
    pub fn bind_session(&self, connection: &Arc<Connection>) -> String {
        let session_id = Uuid::new_v4().to_string();
        self.sessions.insert(session_id.clone(), connection.id);
        let _ = connection.session_id.set(session_id.clone());
        info!(
            connection_id = %connection.id,
            session_id = %session_id,
            "SSE session bound"
        );
        session_id
    }

    /// Look up the connection owning a session.
    ///
    /// Returns `None` for unknown sessions and for sessions whose
    /// connection is no longer open.
    pub fn lookup_session(&self, session_id: &str) -> Option<Arc<Connection>> {
        let connection_id = *self.sessions.get(session_id)?;
        let connection = self.connections.get(&connection_id)?.clone();
        if connection.state() == ConnectionState::Closed {
            return None;
        }
        Some(connection)
    }

    /// Fetch a connection by id.
    pub fn get(&self, connection_id: Uuid) -> Option<Arc<Connection>> {
        self.connections.get(&connection_id).map(|c| c.clone())
    }

    /// Move a connection to `Draining`: no new inbound frames.
    pub fn mark_draining(&self, connection: &Connection) {
        connection.transition(STATE_OPEN, STATE_DRAINING);
    }

    /// Close a connection.
    ///
    /// Idempotent. Cancels the connection's token (which cancels every
    /// in-flight request on it), destroys any bound session, and drops
    /// the registry entry.
    pub fn close(&self, connection: &Connection, reason: &str) {
        let was_open = connection.transition(STATE_OPEN, STATE_CLOSED)
            || connection.transition(STATE_DRAINING, STATE_CLOSED);
        if !was_open {
            return;
        }
        connection.cancel.cancel();
        if let Some(session_id) = connection.session_id.get() {
            self.sessions.remove(session_id);
        }
        self.connections.remove(&connection.id);
        info!(
            connection_id = %connection.id,
            transport = connection.transport.as_str(),
            pending = connection.pending_count(),
            reason = reason,
            "Connection closed"
        );
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of live connections on one transport.
    pub fn connection_count_for(&self, transport: TransportKind) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.transport == transport)
            .count()
    }

    /// Total requests in flight across all connections.
    pub fn total_pending(&self) -> usize {
        self.connections
            .iter()
            .map(|entry| entry.pending_count())
            .sum()
    }

    /// Send a notification to every streaming connection.
    ///
    /// Returns how many connections accepted it.
    pub fn broadcast_notification(&self, method: &str, params: Value) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.send_notification(method, params.clone()))
            .count()
    }

    /// Drain every connection.
    ///
    /// Transitions all connections to `Draining`, waits up to `timeout`
    /// for their pending sets to empty, then force-closes whatever
    /// remains (cancelling those requests).
    pub async fn drain_all(&self, timeout: Duration) {
        for entry in self.connections.iter() {
            self.mark_draining(&entry);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let pending = self.total_pending();
            if pending == 0 {
                break;
            }
            if Instant::now() > deadline {
                warn!(pending, "Drain timeout exceeded, force-closing connections");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let remaining: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| entry.clone())
            .collect();
        for connection in remaining {
            self.close(&connection, "server drain");
        }
    }
}
