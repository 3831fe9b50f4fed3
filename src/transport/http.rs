//! HTTP transport adapter.
//!
//! Single configurable endpoint (default `POST /rpc`); one request body
//! is one frame, one response body is the response frame. Connection
//! lifetime is one request and the server never initiates messages.
//!
//! Status mapping: 200 for any JSON-RPC response (including error
//! responses), 204 for pure notifications, 400 for non-JSON bodies,
//! 405 for non-POST on the RPC path, 413 for oversize bodies, 503
//! while draining.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CorsConfig, HttpConfig};
use crate::dispatch::Dispatcher;
use crate::events::{EventBus, ServerEvent};
use crate::lifecycle::LifecycleManager;
use crate::protocol::encode;
use crate::session::{ConnectionRegistry, OutboundSink, TransportKind};

/// Shared state for the HTTP adapter.
pub struct HttpState {
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: Arc<ConnectionRegistry>,
    pub lifecycle: Arc<LifecycleManager>,
    pub events: EventBus,
    pub config: HttpConfig,
}

/// Build the HTTP router.
pub fn router(state: Arc<HttpState>, cors: &CorsConfig) -> Router {
    let max_body = state.config.max_request_bytes;
    Router::new()
        .route(&state.config.rpc_path, post(handle_rpc))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(super::cors_layer(cors))
        .with_state(state)
}

/// Serve the adapter until `shutdown` fires.
pub async fn serve(
    state: Arc<HttpState>,
    cors: CorsConfig,
    listener: tokio::net::TcpListener,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(state, &cors);
    info!(addr = ?listener.local_addr().ok(), "HTTP transport listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await?;
    Ok(())
}

async fn handle_rpc(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if state.lifecycle.is_shutting_down() {
        warn!(peer = %peer, "Rejected request: draining");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "application/json")],
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32004,"message":"Server busy"}}"#,
        )
            .into_response();
    }

    // Defense in depth behind DefaultBodyLimit.
    if body.len() > state.config.max_request_bytes {
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }

    // Non-JSON bodies are a transport-level 400; the JSON-RPC parse
    // error still travels in the body for clients that look.
    let is_json = serde_json::from_slice::<serde::de::IgnoredAny>(&body).is_ok();

    let credential = super::extract_credential(&headers);
    let connection = state
        .sessions
        .open(TransportKind::Http, Some(peer), OutboundSink::Http, 1);
    state.events.publish(ServerEvent::ConnectionOpened {
        connection_id: connection.id,
        transport: TransportKind::Http,
    });
    if let Some(metrics) = crate::metrics::get_metrics() {
        metrics.record_connection("http");
    }

    let outbound = state
        .dispatcher
        .dispatch_frame(connection.clone(), credential, &body)
        .await;

    state.sessions.close(&connection, "request complete");
    state.events.publish(ServerEvent::ConnectionClosed {
        connection_id: connection.id,
        transport: TransportKind::Http,
        reason: "request complete".to_string(),
    });

    match outbound {
        Some(frame) => {
            let status = if is_json {
                StatusCode::OK
            } else {
                StatusCode::BAD_REQUEST
            };
            debug!(peer = %peer, status = %status, "HTTP frame answered");
            (
                status,
                [(header::CONTENT_TYPE, "application/json")],
                encode(&frame),
            )
                .into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
