//! Shared test harness: a tool module and fully wired adapter states.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use toolbridge::config::{LimitsConfig, ServerConfig};
use toolbridge::dispatch::{Dispatcher, ServerInfo};
use toolbridge::events::EventBus;
use toolbridge::lifecycle::LifecycleManager;
use toolbridge::middleware::build_chain;
use toolbridge::registry::{ToolContext, ToolDefinition, ToolError, ToolErrorKind, ToolModule, ToolRegistry};
use toolbridge::session::ConnectionRegistry;
use toolbridge::transport::{http, sse, ws};

/// Echo and sleep tools in the root namespace.
pub struct TestTools;

#[async_trait]
impl ToolModule for TestTools {
    fn namespace(&self) -> &str {
        "test"
    }

    fn prefix_tools(&self) -> bool {
        false
    }

    fn list(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "echo".to_string(),
                display_name: None,
                description: "Echoes its arguments".to_string(),
                version: "1.0.0".to_string(),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {"x": {"type": "string"}}
                }),
                output_schema: None,
                tags: vec![],
            },
            ToolDefinition {
                name: "sleep".to_string(),
                display_name: None,
                description: "Sleeps for the given milliseconds".to_string(),
                version: "1.0.0".to_string(),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {"ms": {"type": "integer"}}
                }),
                output_schema: None,
                tags: vec![],
            },
        ]
    }

    async fn call(
        &self,
        tool_name: &str,
        arguments: Value,
        ctx: ToolContext,
    ) -> Result<Value, ToolError> {
        match tool_name {
            "echo" => Ok(serde_json::json!({
                "content": arguments.get("x").cloned().unwrap_or(Value::Null)
            })),
            "sleep" => {
                let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(50);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                        Ok(serde_json::json!({"slept": ms}))
                    }
                    _ = ctx.cancel.cancelled() => {
                        Err(ToolError::new(ToolErrorKind::Internal, "cancelled"))
                    }
                }
            }
            other => Err(ToolError::new(ToolErrorKind::NotFound, other)),
        }
    }
}

/// Everything the transport tests need, wired the way `main` wires it.
pub struct Harness {
    pub config: ServerConfig,
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: Arc<ConnectionRegistry>,
    pub lifecycle: Arc<LifecycleManager>,
    pub events: EventBus,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_limits(LimitsConfig::default())
    }

    pub fn with_limits(limits: LimitsConfig) -> Self {
        let mut config = ServerConfig::default();
        config.limits = limits;
        Self::with_config(config)
    }

    pub fn with_middleware(middleware: toolbridge::config::MiddlewareConfig) -> Self {
        let mut config = ServerConfig::default();
        config.middleware = middleware;
        Self::with_config(config)
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(TestTools)).expect("register test tools");
        let chain = build_chain(&config.middleware, None, CancellationToken::new());
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            config.limits.clone(),
            chain,
            EventBus::new(),
            ServerInfo::default(),
        ));
        let lifecycle = Arc::new(LifecycleManager::new());
        lifecycle.mark_ready();

        Self {
            config,
            dispatcher,
            sessions: Arc::new(ConnectionRegistry::new()),
            lifecycle,
            events: EventBus::new(),
        }
    }

    pub fn http_state(&self) -> Arc<http::HttpState> {
        Arc::new(http::HttpState {
            dispatcher: self.dispatcher.clone(),
            sessions: self.sessions.clone(),
            lifecycle: self.lifecycle.clone(),
            events: self.events.clone(),
            config: self.config.http.clone(),
        })
    }

    pub fn sse_state(&self) -> Arc<sse::SseState> {
        Arc::new(sse::SseState::new(
            self.dispatcher.clone(),
            self.sessions.clone(),
            self.lifecycle.clone(),
            self.events.clone(),
            self.config.sse.clone(),
            self.config.limits.per_connection,
            self.config.http.max_request_bytes,
        ))
    }

    pub fn ws_state(&self) -> Arc<ws::WsState> {
        Arc::new(ws::WsState {
            dispatcher: self.dispatcher.clone(),
            sessions: self.sessions.clone(),
            lifecycle: self.lifecycle.clone(),
            events: self.events.clone(),
            config: self.config.ws.clone(),
            per_connection_limit: self.config.limits.per_connection,
        })
    }

    /// Serve the WebSocket adapter on an ephemeral port.
    pub async fn spawn_ws(&self) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let state = self.ws_state();
        let cors = self.config.cors.clone();
        let shutdown = self.lifecycle.shutdown_token();
        tokio::spawn(async move {
            let _ = ws::serve(state, cors, listener, shutdown).await;
        });
        addr
    }
}

/// Inject the peer-address extension `oneshot` calls need.
pub fn with_peer(mut request: axum::http::Request<axum::body::Body>) -> axum::http::Request<axum::body::Body> {
    request
        .extensions_mut()
        .insert(axum::extract::ConnectInfo::<SocketAddr>(
            "127.0.0.1:4242".parse().expect("addr"),
        ));
    request
}
