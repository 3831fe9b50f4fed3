//! toolbridge server entry point.
//!
//! Startup sequence: observability → configuration → tool registry →
//! dispatcher → transports (HTTP, WebSocket, SSE). The ready signal
//! fires only once every transport listener is bound. Shutdown runs in
//! reverse: transports stop accepting, connections drain, the
//! dispatcher refuses new work, tool modules shut down. A second stop
//! signal during the drain forces an immediate close.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use serde_json::Value;
use tracing::{error, info, warn};

use toolbridge::config::ServerConfig;
use toolbridge::dispatch::{Dispatcher, ServerInfo};
use toolbridge::events::EventBus;
use toolbridge::lifecycle::{health_router, LifecycleManager};
use toolbridge::middleware::{build_chain, Authenticator, StaticTokenAuthenticator};
use toolbridge::registry::{ToolContext, ToolDefinition, ToolError, ToolModule, ToolRegistry};
use toolbridge::session::ConnectionRegistry;
use toolbridge::transport::{http, sse, ws};

/// Command-line options; every value can also come from the
/// environment (`TOOLBRIDGE_*`).
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// HTTP transport bind address
    #[arg(long, env = "TOOLBRIDGE_HTTP_BIND")]
    http_bind: Option<String>,

    /// WebSocket transport bind address
    #[arg(long, env = "TOOLBRIDGE_WS_BIND")]
    ws_bind: Option<String>,

    /// SSE transport bind address
    #[arg(long, env = "TOOLBRIDGE_SSE_BIND")]
    sse_bind: Option<String>,

    /// Prometheus metrics port (requires the `metrics` build)
    #[cfg(feature = "metrics")]
    #[arg(long, env = "TOOLBRIDGE_METRICS_PORT", default_value = "9090")]
    metrics_port: u16,
}

/// Built-in legacy basic tools (root namespace).
struct BasicTools;

#[async_trait]
impl ToolModule for BasicTools {
    fn namespace(&self) -> &str {
        "basic"
    }

    fn prefix_tools(&self) -> bool {
        false
    }

    fn list(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: "echo".to_string(),
            display_name: Some("Echo".to_string()),
            description: "Echoes its arguments back to the caller".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "x": { "type": "string", "description": "Text to echo" }
                }
            }),
            output_schema: None,
            tags: vec!["basic".to_string()],
        }]
    }

    async fn call(
        &self,
        _tool_name: &str,
        arguments: Value,
        _ctx: ToolContext,
    ) -> Result<Value, ToolError> {
        Ok(serde_json::json!({
            "content": arguments.get("x").cloned().unwrap_or(Value::Null)
        }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Phase 1: observability
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Phase 2: configuration
    let cli = Cli::parse();
    let mut config = ServerConfig::from_env();
    if let Some(bind) = cli.http_bind {
        config.http.bind = bind;
    }
    if let Some(bind) = cli.ws_bind {
        config.ws.bind = bind;
    }
    if let Some(bind) = cli.sse_bind {
        config.sse.bind = bind;
    }
    config.validate()?;

    // Phase 3: metrics exporter
    #[cfg(feature = "metrics")]
    {
        use opentelemetry::global;
        use opentelemetry_sdk::metrics::SdkMeterProvider;

        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(prometheus::default_registry().clone())
            .build()?;
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        global::set_meter_provider(provider);

        let meter = global::meter("toolbridge");
        toolbridge::metrics::init_metrics(&meter);

        let metrics_port = cli.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(metrics_port).await {
                error!(error = %e, "Metrics server error");
            }
        });
        info!(metrics_port, "Metrics endpoint started");
    }

    // Phase 4: core components
    let lifecycle = Arc::new(LifecycleManager::new());
    let events = EventBus::new();
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(BasicTools))?;

    let authenticator: Option<Arc<dyn Authenticator>> = config
        .middleware
        .auth
        .static_token
        .as_ref()
        .map(|token| Arc::new(StaticTokenAuthenticator::new(token)) as Arc<dyn Authenticator>);
    let chain = build_chain(&config.middleware, authenticator, lifecycle.shutdown_token());

    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        config.limits.clone(),
        chain,
        events.clone(),
        ServerInfo::default(),
    ));
    let sessions = Arc::new(ConnectionRegistry::new());

    // Phase 5: bind transports. All listeners bind before any serve
    // loop starts so a bad address fails startup outright.
    let http_listener = tokio::net::TcpListener::bind(&config.http.bind).await?;
    let ws_listener = tokio::net::TcpListener::bind(&config.ws.bind).await?;
    let sse_listener = tokio::net::TcpListener::bind(&config.sse.bind).await?;

    let shutdown = lifecycle.shutdown_token();

    let http_state = Arc::new(http::HttpState {
        dispatcher: dispatcher.clone(),
        sessions: sessions.clone(),
        lifecycle: lifecycle.clone(),
        events: events.clone(),
        config: config.http.clone(),
    });
    let http_app = http::router(http_state, &config.cors)
        .merge(health_router(lifecycle.clone(), sessions.clone()));
    let http_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let serve = axum::serve(
            http_listener,
            http_app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .with_graceful_shutdown(http_shutdown.cancelled_owned());
        if let Err(e) = serve.await {
            error!(error = %e, "HTTP transport error");
        }
    });
    info!(bind = %config.http.bind, rpc_path = %config.http.rpc_path, "HTTP transport listening");

    let ws_state = Arc::new(ws::WsState {
        dispatcher: dispatcher.clone(),
        sessions: sessions.clone(),
        lifecycle: lifecycle.clone(),
        events: events.clone(),
        config: config.ws.clone(),
        per_connection_limit: config.limits.per_connection,
    });
    let ws_cors = config.cors.clone();
    let ws_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = ws::serve(ws_state, ws_cors, ws_listener, ws_shutdown).await {
            error!(error = %e, "WebSocket transport error");
        }
    });
    info!(bind = %config.ws.bind, path = %config.ws.path, "WebSocket transport listening");

    let sse_state = Arc::new(sse::SseState::new(
        dispatcher.clone(),
        sessions.clone(),
        lifecycle.clone(),
        events.clone(),
        config.sse.clone(),
        config.limits.per_connection,
        config.http.max_request_bytes,
    ));
    let sse_cors = config.cors.clone();
    let sse_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = sse::serve(sse_state, sse_cors, sse_listener, sse_shutdown).await {
            error!(error = %e, "SSE transport error");
        }
    });
    info!(bind = %config.sse.bind, stream_path = %config.sse.stream_path, "SSE transport listening");

    // Phase 6: ready
    info!(tools = registry.tool_count(), "Tool registry initialized");
    lifecycle.mark_ready();

    // Signal handling: first signal drains, second forces.
    let force = tokio_util::sync::CancellationToken::new();
    setup_signal_handlers(lifecycle.clone(), force.clone());

    // Wait for shutdown to begin.
    lifecycle.shutdown_token().cancelled().await;

    // Graceful stop: listeners already refuse accepts (token above),
    // drain connections, refuse new acquisitions, shut tools down.
    dispatcher.refuse_new_work();
    let drain_timeout = config.drain_timeout;
    tokio::select! {
        _ = sessions.drain_all(drain_timeout) => {
            info!("Drain complete");
        }
        _ = force.cancelled() => {
            warn!("Forced shutdown, skipping drain");
        }
    }
    registry.shutdown_modules().await;
    lifecycle.mark_stopped();
    info!("toolbridge stopped");
    Ok(())
}

/// First SIGINT/SIGTERM begins the drain; the second forces close.
fn setup_signal_handlers(
    lifecycle: Arc<LifecycleManager>,
    force: tokio_util::sync::CancellationToken,
) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Stop signal received, draining");
        lifecycle.begin_shutdown();

        wait_for_signal().await;
        lifecycle.force_shutdown();
        force.cancel();
    });
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Serve the Prometheus scrape endpoint.
#[cfg(feature = "metrics")]
async fn serve_metrics(port: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use axum::response::IntoResponse;
    use axum::routing::get;

    async fn metrics_handler() -> impl IntoResponse {
        use prometheus::{Encoder, TextEncoder};

        let metrics = prometheus::default_registry().gather();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metrics, &mut buffer) {
            return (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
                .into_response();
        }
        (
            axum::http::StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; charset=utf-8",
            )],
            buffer,
        )
            .into_response()
    }

    let app = axum::Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
