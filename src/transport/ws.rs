//! WebSocket transport adapter.
//!
//! Each text frame carries exactly one JSON-RPC frame; responses are
//! correlated by `id` and may arrive in any order. The server pings on
//! an interval and closes with 1011 after two consecutive unanswered
//! pings; oversize frames close with 1009. Peer close drains owed
//! responses before the socket is torn down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CorsConfig, WsConfig};
use crate::dispatch::Dispatcher;
use crate::events::{EventBus, ServerEvent};
use crate::lifecycle::LifecycleManager;
use crate::protocol::encode;
use crate::session::{Connection, ConnectionRegistry, OutboundSink, TransportKind};

/// Close code for oversize frames.
const CLOSE_TOO_BIG: u16 = 1009;
/// Close code for ping timeouts.
const CLOSE_INTERNAL: u16 = 1011;
/// Close code for connection-limit rejection.
const CLOSE_OVERLOADED: u16 = 1013;

/// How long a draining socket waits for owed responses.
const PEER_CLOSE_DRAIN: Duration = Duration::from_secs(5);

/// Shared state for the WebSocket adapter.
pub struct WsState {
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: Arc<ConnectionRegistry>,
    pub lifecycle: Arc<LifecycleManager>,
    pub events: EventBus,
    pub config: WsConfig,
    pub per_connection_limit: usize,
}

/// Build the WebSocket router.
pub fn router(state: Arc<WsState>, cors: &CorsConfig) -> Router {
    Router::new()
        .route(&state.config.path, get(handle_upgrade))
        .layer(super::cors_layer(cors))
        .with_state(state)
}

/// Serve the adapter until `shutdown` fires.
pub async fn serve(
    state: Arc<WsState>,
    cors: CorsConfig,
    listener: tokio::net::TcpListener,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(state, &cors);
    info!(addr = ?listener.local_addr().ok(), "WebSocket transport listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await?;
    Ok(())
}

async fn handle_upgrade(
    State(state): State<Arc<WsState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if state.lifecycle.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if state.sessions.connection_count_for(TransportKind::Ws) >= state.config.max_connections {
        warn!(peer = %peer, "WebSocket connection limit reached");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    // Credential slot: Authorization header, else the subprotocol.
    let credential = super::extract_credential(&headers).or_else(|| {
        headers
            .get("sec-websocket-protocol")
            .and_then(|value| value.to_str().ok())
            .map(String::from)
    });

    let max_message = state.config.max_message_bytes;
    ws.max_message_size(max_message)
        .on_upgrade(move |socket| handle_socket(state, socket, peer, credential))
}

async fn handle_socket(
    state: Arc<WsState>,
    socket: WebSocket,
    peer: SocketAddr,
    credential: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();

    // All writes funnel through one task so dispatch tasks, pings, and
    // close frames never interleave mid-frame.
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);

    // Bridge the registry-facing string sink into the message channel.
    let (notify_tx, mut notify_rx) = mpsc::channel::<String>(64);
    let bridge_tx = out_tx.clone();
    let bridge = tokio::spawn(async move {
        while let Some(text) = notify_rx.recv().await {
            if bridge_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let connection = state.sessions.open(
        TransportKind::Ws,
        Some(peer),
        OutboundSink::Ws(notify_tx),
        state.per_connection_limit,
    );
    state.events.publish(ServerEvent::ConnectionOpened {
        connection_id: connection.id,
        transport: TransportKind::Ws,
    });
    if let Some(metrics) = crate::metrics::get_metrics() {
        metrics.record_connection("ws");
    }
    info!(connection_id = %connection.id, peer = %peer, "WebSocket connected");

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let shutdown = state.lifecycle.shutdown_token();
    let mut ping_timer = tokio::time::interval(state.config.ping_interval);
    ping_timer.tick().await; // the first tick fires immediately
    let mut unanswered_pings: u8 = 0;
    let mut close_reason = "peer closed";

    loop {
        tokio::select! {
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if text.len() > state.config.max_message_bytes {
                        let _ = out_tx.send(close_frame(CLOSE_TOO_BIG, "message too big")).await;
                        close_reason = "oversize frame";
                        break;
                    }
                    spawn_dispatch(&state, &connection, &credential, text.into_bytes(), &out_tx);
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if bytes.len() > state.config.max_message_bytes {
                        let _ = out_tx.send(close_frame(CLOSE_TOO_BIG, "message too big")).await;
                        close_reason = "oversize frame";
                        break;
                    }
                    spawn_dispatch(&state, &connection, &credential, bytes, &out_tx);
                }
                Some(Ok(Message::Pong(_))) => {
                    unanswered_pings = 0;
                }
                Some(Ok(Message::Ping(_))) => {
                    // The websocket stack answers pings on its own.
                }
                Some(Ok(Message::Close(_))) => {
                    // Graceful close: finish owed responses, then answer
                    // the close handshake.
                    state.sessions.mark_draining(&connection);
                    drain_pending(&connection).await;
                    let _ = out_tx.send(Message::Close(None)).await;
                    break;
                }
                None => {
                    close_reason = "peer disconnected";
                    break;
                }
                Some(Err(error)) => {
                    debug!(connection_id = %connection.id, error = %error, "WebSocket read error");
                    let _ = out_tx.send(close_frame(CLOSE_TOO_BIG, "protocol error")).await;
                    close_reason = "protocol error";
                    break;
                }
            },
            _ = ping_timer.tick() => {
                if unanswered_pings >= 2 {
                    warn!(connection_id = %connection.id, "Two pings unanswered, closing");
                    let _ = out_tx.send(close_frame(CLOSE_INTERNAL, "ping timeout")).await;
                    close_reason = "ping timeout";
                    break;
                }
                unanswered_pings += 1;
                if out_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    close_reason = "write failed";
                    break;
                }
            },
            _ = shutdown.cancelled() => {
                state.sessions.mark_draining(&connection);
                drain_pending(&connection).await;
                let _ = out_tx.send(close_frame(CLOSE_OVERLOADED, "server shutting down")).await;
                close_reason = "server shutdown";
                break;
            }
        }
    }

    // Closing cancels every in-flight request on this socket.
    state.sessions.close(&connection, close_reason);
    state.events.publish(ServerEvent::ConnectionClosed {
        connection_id: connection.id,
        transport: TransportKind::Ws,
        reason: close_reason.to_string(),
    });
    // Tear down the write path: aborting the bridge drops its sender,
    // so the writer drains what is queued (the close frame) and exits.
    bridge.abort();
    drop(out_tx);
    let _ = writer.await;
}

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// Dispatch one inbound frame on its own task; the response (if owed)
/// goes back through the write channel.
fn spawn_dispatch(
    state: &Arc<WsState>,
    connection: &Arc<Connection>,
    credential: &Option<String>,
    bytes: Vec<u8>,
    out_tx: &mpsc::Sender<Message>,
) {
    if !connection.is_open() {
        debug!(connection_id = %connection.id, "Dropping frame on draining socket");
        return;
    }
    let dispatcher = state.dispatcher.clone();
    let connection = connection.clone();
    let credential = credential.clone();
    let out_tx = out_tx.clone();
    tokio::spawn(async move {
        if let Some(frame) = dispatcher
            .dispatch_frame(connection, credential, &bytes)
            .await
        {
            if let Ok(text) = String::from_utf8(encode(&frame)) {
                let _ = out_tx.send(Message::Text(text)).await;
            }
        }
    });
}

/// Wait (bounded) for owed responses on a draining socket.
async fn drain_pending(connection: &Arc<Connection>) {
    let deadline = tokio::time::Instant::now() + PEER_CLOSE_DRAIN;
    while connection.pending_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LimitsConfig, MiddlewareConfig, ServerConfig};
    use crate::dispatch::ServerInfo;
    use crate::middleware::build_chain;
    use crate::registry::ToolRegistry;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> (Arc<WsState>, CorsConfig) {
        let config = ServerConfig::default();
        let chain = build_chain(
            &MiddlewareConfig::default(),
            None,
            CancellationToken::new(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(ToolRegistry::new()),
            LimitsConfig::default(),
            chain,
            EventBus::new(),
            ServerInfo::default(),
        ));
        let lifecycle = Arc::new(LifecycleManager::new());
        lifecycle.mark_ready();
        (
            Arc::new(WsState {
                dispatcher,
                sessions: Arc::new(ConnectionRegistry::new()),
                lifecycle,
                events: EventBus::new(),
                config: config.ws,
                per_connection_limit: config.limits.per_connection,
            }),
            config.cors,
        )
    }

    fn upgrade_request() -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri("/ws")
            .header("host", "localhost")
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap()
    }

    async fn call(app: Router, mut request: Request<Body>) -> axum::response::Response {
        request
            .extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("127.0.0.1:9999".parse().unwrap()));
        app.oneshot(request).await.unwrap()
    }

    #[tokio::test]
    async fn test_upgrade_accepted() {
        let (state, cors) = test_state();
        let response = call(router(state, &cors), upgrade_request()).await;
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
    }

    #[tokio::test]
    async fn test_upgrade_rejected_while_draining() {
        let (state, cors) = test_state();
        state.lifecycle.begin_shutdown();
        let response = call(router(state, &cors), upgrade_request()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_upgrade_rejected_over_connection_limit() {
        let (state, cors) = test_state();
        // Saturate the limit with registry entries.
        for _ in 0..state.config.max_connections {
            let (tx, _rx) = mpsc::channel(1);
            state
                .sessions
                .open(TransportKind::Ws, None, OutboundSink::Ws(tx), 1);
        }
        let response = call(router(state, &cors), upgrade_request()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_plain_get_is_not_upgraded() {
        let (state, cors) = test_state();
        let request = Request::builder()
            .method("GET")
            .uri("/ws")
            .body(Body::empty())
            .unwrap();
        let response = call(router(state, &cors), request).await;
        // WebSocketUpgrade rejects non-upgrade requests.
        assert_ne!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert!(response.status().is_client_error());
    }
}
