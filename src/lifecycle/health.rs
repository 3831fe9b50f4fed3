//! Liveness endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;

use super::LifecycleManager;
use crate::session::ConnectionRegistry;

/// Payload returned by `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: usize,
    pub uptime_seconds: u64,
    pub version: &'static str,
}

#[derive(Clone)]
struct HealthState {
    lifecycle: Arc<LifecycleManager>,
    sessions: Arc<ConnectionRegistry>,
}

/// Build the `/health` router.
///
/// Returns `{"status":"ok", ...}` with 200 while the transports are up
/// and the server is not draining; 503 otherwise.
pub fn health_router(
    lifecycle: Arc<LifecycleManager>,
    sessions: Arc<ConnectionRegistry>,
) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(HealthState {
            lifecycle,
            sessions,
        })
}

async fn health_handler(State(state): State<HealthState>) -> Response {
    let healthy = state.lifecycle.is_ready();
    let body = HealthResponse {
        status: if healthy { "ok" } else { "unavailable" },
        connections: state.sessions.connection_count(),
        uptime_seconds: state.lifecycle.uptime_seconds(),
        version: state.lifecycle.version(),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, axum::Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn call_health(lifecycle: Arc<LifecycleManager>) -> (StatusCode, serde_json::Value) {
        let sessions = Arc::new(ConnectionRegistry::new());
        let app = health_router(lifecycle, sessions);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_ok_when_ready() {
        let lifecycle = Arc::new(LifecycleManager::new());
        lifecycle.mark_ready();
        let (status, body) = call_health(lifecycle).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
    }

    #[tokio::test]
    async fn test_health_unavailable_while_draining() {
        let lifecycle = Arc::new(LifecycleManager::new());
        lifecycle.mark_ready();
        lifecycle.begin_shutdown();
        let (status, body) = call_health(lifecycle).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unavailable");
    }
}
