//! Legacy SSE + POST transport adapter (n8n-compatible).
//!
//! Two endpoints on one listener:
//!
//! - `GET /sse` opens a `text/event-stream`. The first event is always
//!   `event: endpoint` whose data is the POST path with the new session
//!   id. Keepalive is `event: ping` / `data: {}`; responses arrive as
//!   `event: message`; the stream ends with `event: close`.
//! - `POST /messages?sessionId=<sid>` feeds one frame into the bound
//!   session, answers `202 Accepted` with an empty body, and delivers
//!   the response frame asynchronously over the stream.
//!
//! Within one stream, `message` events are emitted in the order their
//! POSTs were accepted, not the order they finished: each accepted POST
//! enqueues a slot into a per-session mailbox and a single writer
//! drains the mailbox in FIFO order.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, DefaultBodyLimit, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CorsConfig, SseConfig, SESSION_HEADER};
use crate::dispatch::Dispatcher;
use crate::events::{EventBus, ServerEvent};
use crate::lifecycle::LifecycleManager;
use crate::protocol::encode;
use crate::session::{Connection, ConnectionRegistry, OutboundSink, SseEvent, TransportKind};

/// A response slot handed to the stream writer at POST-accept time.
type PendingResponse = oneshot::Receiver<Option<String>>;

/// Depth of the per-session ordered mailbox.
const MAILBOX_DEPTH: usize = 256;

/// Shared state for the SSE adapter.
pub struct SseState {
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: Arc<ConnectionRegistry>,
    pub lifecycle: Arc<LifecycleManager>,
    pub events: EventBus,
    pub config: SseConfig,
    pub per_connection_limit: usize,
    pub max_request_bytes: usize,
    /// session id -> ordered response mailbox
    mailboxes: DashMap<String, mpsc::Sender<PendingResponse>>,
}

impl SseState {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        sessions: Arc<ConnectionRegistry>,
        lifecycle: Arc<LifecycleManager>,
        events: EventBus,
        config: SseConfig,
        per_connection_limit: usize,
        max_request_bytes: usize,
    ) -> Self {
        Self {
            dispatcher,
            sessions,
            lifecycle,
            events,
            config,
            per_connection_limit,
            max_request_bytes,
            mailboxes: DashMap::new(),
        }
    }
}

/// Build the SSE router (stream + messages endpoints).
pub fn router(state: Arc<SseState>, cors: &CorsConfig) -> Router {
    let max_body = state.max_request_bytes;
    Router::new()
        .route(&state.config.stream_path, get(handle_stream))
        .route(&state.config.messages_path, post(handle_message))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(super::cors_layer(cors))
        .with_state(state)
}

/// Serve the adapter until `shutdown` fires.
pub async fn serve(
    state: Arc<SseState>,
    cors: CorsConfig,
    listener: tokio::net::TcpListener,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(state, &cors);
    info!(addr = ?listener.local_addr().ok(), "SSE transport listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await?;
    Ok(())
}

/// Removes the session's mailbox and registry entry when the stream
/// future is dropped, whether it ended cleanly or the client vanished.
struct StreamGuard {
    state: Arc<SseState>,
    connection: Arc<Connection>,
    session_id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.state.mailboxes.remove(&self.session_id);
        self.state.sessions.close(&self.connection, "stream ended");
        self.state.events.publish(ServerEvent::ConnectionClosed {
            connection_id: self.connection.id,
            transport: TransportKind::Sse,
            reason: "stream ended".to_string(),
        });
    }
}

async fn handle_stream(
    State(state): State<Arc<SseState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    if state.lifecycle.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if state.sessions.connection_count_for(TransportKind::Sse) >= state.config.max_connections {
        warn!(peer = %peer, "SSE connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    }

    let (notify_tx, mut notify_rx) = mpsc::channel::<SseEvent>(64);
    let connection = state.sessions.open(
        TransportKind::Sse,
        Some(peer),
        OutboundSink::Sse(notify_tx),
        state.per_connection_limit,
    );
    let session_id = state.sessions.bind_session(&connection);

    let (mailbox_tx, mut mailbox_rx) = mpsc::channel::<PendingResponse>(MAILBOX_DEPTH);
    state.mailboxes.insert(session_id.clone(), mailbox_tx);

    state.events.publish(ServerEvent::ConnectionOpened {
        connection_id: connection.id,
        transport: TransportKind::Sse,
    });
    if let Some(metrics) = crate::metrics::get_metrics() {
        metrics.record_connection("sse");
    }
    info!(connection_id = %connection.id, session_id = %session_id, peer = %peer, "SSE stream opened");

    let endpoint_data = format!(
        "{}?sessionId={}",
        state.config.messages_path, session_id
    );
    let ping_interval = state.config.ping_interval;
    let cancel = connection.cancel.clone();
    let guard = StreamGuard {
        state: state.clone(),
        connection: connection.clone(),
        session_id: session_id.clone(),
    };

    let stream = async_stream::stream! {
        let _guard = guard;
        let mut ping_timer = tokio::time::interval(ping_interval);
        ping_timer.tick().await; // the first tick fires immediately

        // The very first event names the POST endpoint for this session.
        yield Ok::<Event, Infallible>(Event::default().event("endpoint").data(endpoint_data));

        'stream: loop {
            tokio::select! {
                slot = mailbox_rx.recv() => match slot {
                    Some(mut pending) => {
                        // Hold this slot until its response lands so
                        // later POSTs cannot overtake it; keepalive
                        // pings continue while it is pending.
                        loop {
                            tokio::select! {
                                response = &mut pending => {
                                    if let Ok(Some(json)) = response {
                                        yield Ok(Event::default().event("message").data(json));
                                    }
                                    break;
                                }
                                _ = ping_timer.tick() => {
                                    yield Ok(Event::default().event("ping").data("{}"));
                                }
                                _ = cancel.cancelled() => {
                                    yield Ok(Event::default().event("close").data(r#"{"reason":"server closing"}"#));
                                    break 'stream;
                                }
                            }
                        }
                    }
                    None => break 'stream,
                },
                notification = notify_rx.recv() => match notification {
                    Some(event) => {
                        yield Ok(Event::default().event(event.event).data(event.data));
                    }
                    None => break 'stream,
                },
                _ = ping_timer.tick() => {
                    yield Ok(Event::default().event("ping").data("{}"));
                }
                _ = cancel.cancelled() => {
                    yield Ok(Event::default().event("close").data(r#"{"reason":"server closing"}"#));
                    break 'stream;
                }
            }
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::CACHE_CONTROL, "no-cache".parse().expect("static header"));
    headers.insert(header::CONNECTION, "keep-alive".parse().expect("static header"));
    headers.insert("X-Accel-Buffering", "no".parse().expect("static header"));
    if let Ok(value) = session_id.parse() {
        headers.insert(SESSION_HEADER, value);
    }

    (headers, Sse::new(stream)).into_response()
}

async fn handle_message(
    State(state): State<Arc<SseState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if state.lifecycle.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if body.len() > state.max_request_bytes {
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }

    let Some(session_id) = super::extract_session_id(query.as_deref(), &headers) else {
        debug!(peer = %peer, "POST without session id");
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(connection) = state.sessions.lookup_session(&session_id) else {
        debug!(peer = %peer, session_id = %session_id, "POST for unknown session");
        return StatusCode::NOT_FOUND.into_response();
    };
    if !connection.is_open() {
        // Draining streams accept no new inbound frames.
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let Some(mailbox) = state.mailboxes.get(&session_id).map(|m| m.clone()) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // Acceptance point: enqueue the response slot now so the stream
    // writer emits responses in POST-accept order.
    let (slot_tx, slot_rx) = oneshot::channel();
    if mailbox.try_send(slot_rx).is_err() {
        warn!(session_id = %session_id, "SSE mailbox full, rejecting POST");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let credential = super::extract_credential(&headers);
    let dispatcher = state.dispatcher.clone();
    let bytes = body.to_vec();
    tokio::spawn(async move {
        let outbound = dispatcher
            .dispatch_frame(connection, credential, &bytes)
            .await;
        let serialized = outbound
            .map(|frame| encode(&frame))
            .and_then(|bytes| String::from_utf8(bytes).ok());
        let _ = slot_tx.send(serialized);
    });

    let mut response_headers = HeaderMap::new();
    if let Ok(value) = session_id.parse() {
        response_headers.insert(SESSION_HEADER, value);
    }
    (StatusCode::ACCEPTED, response_headers).into_response()
}
