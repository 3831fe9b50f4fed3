//! Request routing and dispatch.
//!
//! Every transport feeds decoded frames here. The dispatcher runs each
//! request through the middleware chain, routes built-in MCP methods
//! itself, and hands `tools/call` to the registry under the concurrency
//! limits of [`limits::DispatchLimits`]. Nothing escapes uncaught: tool
//! panics map to -32603, declared tool errors to -32002, deadline
//! overruns to -32003.

pub mod limits;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn};
use uuid::Uuid;

use crate::config::LimitsConfig;
use crate::error::BridgeError;
use crate::events::{EventBus, ServerEvent};
use crate::middleware::{MiddlewareChain, RequestCtx, TerminalFn};
use crate::protocol::{
    decode, BatchElement, InboundFrame, JsonRpcId, JsonRpcResponse, OutboundFrame, ParsedRequest,
    SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::registry::{schema, ToolContext, ToolRegistry};
use crate::session::Connection;

pub use limits::{DispatchLimits, DispatchSlot};

/// Server identity reported by `initialize`.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A request currently in flight, keyed by (connection, request id).
struct InFlightRequest {
    method: String,
    accepted_at: Instant,
    cancel: CancellationToken,
}

struct Inner {
    registry: Arc<ToolRegistry>,
    limits: DispatchLimits,
    events: EventBus,
    server_info: ServerInfo,
    /// (connection id, request id) -> in-flight record, for explicit cancels
    inflight: DashMap<(Uuid, JsonRpcId), InFlightRequest>,
    refuse_new: AtomicBool,
}

/// The request dispatcher shared by all transports.
pub struct Dispatcher {
    inner: Arc<Inner>,
    chain: MiddlewareChain,
    terminal: Box<TerminalFn>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        limits_config: LimitsConfig,
        chain: MiddlewareChain,
        events: EventBus,
        server_info: ServerInfo,
    ) -> Self {
        let inner = Arc::new(Inner {
            registry,
            limits: DispatchLimits::new(limits_config),
            events,
            server_info,
            inflight: DashMap::new(),
            refuse_new: AtomicBool::new(false),
        });
        let terminal_inner = inner.clone();
        let terminal: Box<TerminalFn> = Box::new(move |ctx, req| {
            let inner = terminal_inner.clone();
            Box::pin(async move { inner.handle_method(ctx, req).await })
        });
        Self {
            inner,
            chain,
            terminal,
        }
    }

    /// Stop accepting new work (graceful stop).
    pub fn refuse_new_work(&self) {
        self.inner.refuse_new.store(true, Ordering::SeqCst);
        self.inner.events.publish(ServerEvent::ServerDraining);
    }

    /// Whether new work is refused.
    pub fn is_refusing(&self) -> bool {
        self.inner.refuse_new.load(Ordering::SeqCst)
    }

    /// Free global dispatch slots.
    pub fn available_slots(&self) -> usize {
        self.inner.limits.available_global()
    }

    /// Decode and dispatch one wire frame from a connection.
    ///
    /// Returns `None` when no response body is owed (a lone
    /// notification, or a batch of only notifications).
    pub async fn dispatch_frame(
        &self,
        connection: Arc<Connection>,
        credential: Option<String>,
        bytes: &[u8],
    ) -> Option<OutboundFrame> {
        let frame = match decode(bytes) {
            Ok(frame) => frame,
            Err(failure) => {
                let correlation_id = Uuid::new_v4().to_string();
                debug!(
                    connection_id = %connection.id,
                    correlation_id = %correlation_id,
                    error = failure.error.error_type_name(),
                    "Frame rejected"
                );
                return Some(OutboundFrame::Single(JsonRpcResponse::error(
                    failure.id,
                    failure.error.to_jsonrpc_error(&correlation_id),
                )));
            }
        };

        match frame {
            InboundFrame::Single(request) => self
                .dispatch_request(connection, credential, request)
                .await
                .map(OutboundFrame::Single),
            InboundFrame::Batch(elements) => {
                let futures = elements.into_iter().map(|element| {
                    let connection = connection.clone();
                    let credential = credential.clone();
                    async move {
                        match element {
                            BatchElement::Request(request) => {
                                self.dispatch_request(connection, credential, request).await
                            }
                            BatchElement::Invalid(error) => {
                                let correlation_id = Uuid::new_v4().to_string();
                                Some(JsonRpcResponse::error(
                                    JsonRpcId::Null,
                                    error.to_jsonrpc_error(&correlation_id),
                                ))
                            }
                        }
                    }
                });
                let responses: Vec<JsonRpcResponse> =
                    join_all(futures).await.into_iter().flatten().collect();
                if responses.is_empty() {
                    None
                } else {
                    Some(OutboundFrame::Batch(responses))
                }
            }
        }
    }

    /// Dispatch one parsed request through the middleware chain.
    ///
    /// Returns `None` for notifications.
    pub async fn dispatch_request(
        &self,
        connection: Arc<Connection>,
        credential: Option<String>,
        request: ParsedRequest,
    ) -> Option<JsonRpcResponse> {
        let correlation_id = request.correlation_id;
        let correlation_str = correlation_id.to_string();
        let id = request.id.clone();
        let method = request.method.clone();
        let is_notification = request.is_notification();
        let accepted_at = request.received_at;

        let cancel = connection.cancel.child_token();
        let ctx = RequestCtx {
            connection: connection.clone(),
            credential,
            cancel: cancel.clone(),
        };

        connection.track_request(correlation_id);
        if let Some(id) = &id {
            self.inner.inflight.insert(
                (connection.id, id.clone()),
                InFlightRequest {
                    method: method.clone(),
                    accepted_at,
                    cancel: cancel.clone(),
                },
            );
        }
        self.inner.events.publish(ServerEvent::RequestAccepted {
            correlation_id,
            method: method.clone(),
        });

        let result = self.chain.process(ctx, request, self.terminal.as_ref()).await;

        connection.finish_request(correlation_id);
        if let Some(id) = &id {
            self.inner.inflight.remove(&(connection.id, id.clone()));
        }
        self.inner.events.publish(ServerEvent::RequestCompleted {
            correlation_id,
            method: method.clone(),
            error_code: result.as_ref().err().map(BridgeError::to_jsonrpc_code),
            elapsed_ms: accepted_at.elapsed().as_millis() as u64,
        });

        if is_notification {
            if let Err(error) = result {
                warn!(
                    correlation_id = %correlation_str,
                    method = %method,
                    error = error.error_type_name(),
                    "Notification processing failed"
                );
            }
            return None;
        }

        let id = id.unwrap_or(JsonRpcId::Null);
        Some(match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(error) => JsonRpcResponse::error(id, error.to_jsonrpc_error(&correlation_str)),
        })
    }
}

impl Inner {
    /// Route a request to its handler. Terminal stage of the chain.
    async fn handle_method(
        &self,
        ctx: RequestCtx,
        request: ParsedRequest,
    ) -> Result<Value, BridgeError> {
        match request.method.as_str() {
            "initialize" => Ok(self.handle_initialize(&request)),
            "ping" => Ok(serde_json::json!({})),
            "tools/list" => Ok(self.handle_tools_list()),
            "tools/call" => self.handle_tools_call(ctx, request).await,
            "notifications/initialized" => {
                debug!(connection_id = %ctx.connection.id, "Client initialization complete");
                Ok(Value::Null)
            }
            "notifications/cancelled" => {
                self.handle_cancel_notification(&ctx, &request);
                Ok(Value::Null)
            }
            other => Err(BridgeError::MethodNotFound {
                method: other.to_string(),
                tool: None,
            }),
        }
    }

    fn handle_initialize(&self, request: &ParsedRequest) -> Value {
        let requested = request
            .params
            .as_ref()
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str)
            .unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0]);
        let negotiated = if SUPPORTED_PROTOCOL_VERSIONS.contains(&requested) {
            requested
        } else {
            SUPPORTED_PROTOCOL_VERSIONS[0]
        };

        let client_name = request
            .params
            .as_ref()
            .and_then(|p| p.get("clientInfo"))
            .and_then(|c| c.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        debug!(client = client_name, protocol_version = negotiated, "Client initialize");

        serde_json::json!({
            "protocolVersion": negotiated,
            "capabilities": {
                "tools": { "listChanged": true },
                "logging": {}
            },
            "serverInfo": {
                "name": self.server_info.name,
                "version": self.server_info.version,
            }
        })
    }

    fn handle_tools_list(&self) -> Value {
        let tools: Vec<Value> = self
            .registry
            .list()
            .into_iter()
            .map(|(fq_name, definition)| definition.to_wire(&fq_name))
            .collect();
        serde_json::json!({ "tools": tools })
    }

    fn handle_cancel_notification(&self, ctx: &RequestCtx, request: &ParsedRequest) {
        let target = request
            .params
            .as_ref()
            .and_then(|p| p.get("requestId"))
            .cloned();
        let Some(target) = target else { return };
        let Ok(target_id) = serde_json::from_value::<JsonRpcId>(target) else {
            return;
        };
        if let Some(entry) = self.inflight.get(&(ctx.connection.id, target_id)) {
            debug!(
                connection_id = %ctx.connection.id,
                method = %entry.method,
                inflight_ms = entry.accepted_at.elapsed().as_millis() as u64,
                "Client cancelled in-flight request"
            );
            entry.cancel.cancel();
        }
    }

    async fn handle_tools_call(
        &self,
        ctx: RequestCtx,
        request: ParsedRequest,
    ) -> Result<Value, BridgeError> {
        if self.refuse_new.load(Ordering::SeqCst) {
            return Err(BridgeError::ServerBusy);
        }

        let params = request
            .params
            .as_ref()
            .and_then(Value::as_object)
            .ok_or_else(|| BridgeError::InvalidParams {
                violations: vec!["params must be an object".to_string()],
            })?;
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::InvalidParams {
                violations: vec!["missing required property 'name'".to_string()],
            })?
            .to_string();
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));

        // Per MCP convention an unknown tool reports method-not-found
        // inside the tools/call envelope.
        let resolved = self
            .registry
            .resolve(&name)
            .ok_or_else(|| BridgeError::MethodNotFound {
                method: "tools/call".to_string(),
                tool: Some(name.clone()),
            })?;

        let violations = schema::validate(&arguments, &resolved.definition.input_schema);
        if !violations.is_empty() {
            return Err(BridgeError::InvalidParams { violations });
        }

        let (deadline, timeout) = self
            .limits
            .compute_deadline(Some(&resolved.fq_name), request.client_timeout);
        let slot = self
            .limits
            .acquire(
                Some(&resolved.fq_name),
                &ctx.connection,
                deadline,
                &ctx.cancel,
            )
            .await?;

        if let Some(metrics) = crate::metrics::get_metrics() {
            metrics.increment_inflight();
        }
        let call_result = self
            .run_tool(ctx, request.correlation_id, resolved, arguments, slot, deadline, timeout)
            .await;
        if let Some(metrics) = crate::metrics::get_metrics() {
            metrics.decrement_inflight();
        }
        call_result
    }

    /// Run a resolved tool with deadline and hard-kill discipline.
    ///
    /// The call runs on its own task holding the dispatch slot, so an
    /// uncooperative tool keeps its capacity reserved until the hard
    /// ceiling, at which point the task is aborted and the slot freed.
    #[allow(clippy::too_many_arguments)]
    async fn run_tool(
        &self,
        ctx: RequestCtx,
        correlation_id: Uuid,
        resolved: crate::registry::ResolvedTool,
        arguments: Value,
        slot: DispatchSlot,
        deadline: Instant,
        timeout: std::time::Duration,
    ) -> Result<Value, BridgeError> {
        let fq_name = resolved.fq_name.clone();
        let cancel = ctx.cancel.clone();
        let tool_ctx = ToolContext {
            request_id: correlation_id,
            deadline,
            cancel: cancel.clone(),
            span: info_span!("tool_call", tool = %fq_name, correlation_id = %correlation_id),
        };

        let module = resolved.module.clone();
        let local_name = resolved.local_name.clone();
        let mut task = tokio::spawn(async move {
            let _slot = slot;
            module.call(&local_name, arguments, tool_ctx).await
        });

        let hard_kill = self.limits.hard_kill_after(timeout);
        let outcome = tokio::select! {
            joined = &mut task => Some(joined),
            _ = tokio::time::sleep_until(deadline.into()) => None,
            _ = cancel.cancelled() => {
                // Client gone or explicit cancel: give the tool a moment
                // to observe the token, then abandon it.
                self.abandon_after(task, &fq_name, hard_kill);
                return Err(BridgeError::Cancelled);
            }
        };

        match outcome {
            Some(Ok(Ok(value))) => Ok(value),
            Some(Ok(Err(tool_error))) => Err(BridgeError::ToolExecution {
                tool: fq_name,
                kind: tool_error.kind.as_str().to_string(),
                message: tool_error.message,
            }),
            Some(Err(join_error)) => {
                if join_error.is_panic() {
                    error!(
                        tool = %fq_name,
                        correlation_id = %correlation_id,
                        "Tool panicked"
                    );
                }
                Err(BridgeError::Internal {
                    correlation_id: correlation_id.to_string(),
                })
            }
            None => {
                // Deadline elapsed. Signal cancellation; the slot stays
                // reserved until the tool yields or the hard ceiling.
                cancel.cancel();
                self.abandon_after(task, &fq_name, hard_kill.saturating_sub(timeout));
                Err(BridgeError::Timeout {
                    tool: Some(fq_name),
                    deadline_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Abort an abandoned tool task after `grace`, freeing its slot.
    fn abandon_after(
        &self,
        task: tokio::task::JoinHandle<Result<Value, crate::registry::ToolError>>,
        tool: &str,
        grace: std::time::Duration,
    ) {
        let tool = tool.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !task.is_finished() {
                warn!(tool = %tool, "Tool ignored cancellation, aborting at hard ceiling");
                task.abort();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::build_chain;
    use crate::registry::{ToolDefinition, ToolError, ToolErrorKind, ToolModule};
    use crate::session::{ConnectionRegistry, OutboundSink, TransportKind};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Test module: echo returns its arguments, sleep waits, panic panics.
    struct TestTools;

    #[async_trait]
    impl ToolModule for TestTools {
        fn namespace(&self) -> &str {
            "test"
        }

        fn prefix_tools(&self) -> bool {
            false
        }

        fn list(&self) -> Vec<ToolDefinition> {
            let plain = |name: &str| ToolDefinition {
                name: name.to_string(),
                display_name: None,
                description: format!("{} test tool", name),
                version: "1.0.0".to_string(),
                input_schema: serde_json::json!({"type": "object"}),
                output_schema: None,
                tags: vec![],
            };
            vec![
                ToolDefinition {
                    name: "echo".to_string(),
                    display_name: None,
                    description: "echoes arguments".to_string(),
                    version: "1.0.0".to_string(),
                    input_schema: serde_json::json!({
                        "type": "object",
                        "required": ["x"],
                        "properties": {"x": {"type": "string"}}
                    }),
                    output_schema: None,
                    tags: vec![],
                },
                plain("sleep"),
                plain("panic"),
                plain("fail"),
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
                    let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(10_000);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(serde_json::json!({"slept": ms})),
                        _ = ctx.cancel.cancelled() => Err(ToolError::new(ToolErrorKind::Internal, "cancelled")),
                    }
                }
                "panic" => panic!("tool blew up"),
                "fail" => Err(ToolError::new(ToolErrorKind::Io, "disk on fire")),
                _ => Err(ToolError::new(ToolErrorKind::NotFound, "no such tool")),
            }
        }
    }

    fn test_dispatcher(limits: LimitsConfig) -> (Dispatcher, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(TestTools)).unwrap();
        let chain = build_chain(
            &crate::config::MiddlewareConfig::default(),
            None,
            CancellationToken::new(),
        );
        let dispatcher = Dispatcher::new(
            registry,
            limits,
            chain,
            EventBus::new(),
            ServerInfo::default(),
        );
        (dispatcher, Arc::new(ConnectionRegistry::new()))
    }

    fn http_conn(sessions: &ConnectionRegistry) -> Arc<Connection> {
        sessions.open(TransportKind::Http, None, OutboundSink::Http, 8)
    }

    async fn roundtrip(dispatcher: &Dispatcher, conn: &Arc<Connection>, body: &str) -> Value {
        let frame = dispatcher
            .dispatch_frame(conn.clone(), None, body.as_bytes())
            .await
            .expect("expected a response");
        serde_json::from_slice(&crate::protocol::encode(&frame)).unwrap()
    }

    #[tokio::test]
    async fn test_ping() {
        let (dispatcher, sessions) = test_dispatcher(LimitsConfig::default());
        let conn = http_conn(&sessions);
        let response =
            roundtrip(&dispatcher, &conn, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).await;
        assert_eq!(response["result"], serde_json::json!({}));
        assert_eq!(response["id"], 1);
    }

    #[tokio::test]
    async fn test_initialize_negotiates_version() {
        let (dispatcher, sessions) = test_dispatcher(LimitsConfig::default());
        let conn = http_conn(&sessions);

        let response = roundtrip(
            &dispatcher,
            &conn,
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-03-26","clientInfo":{"name":"n8n"}}}"#,
        )
        .await;
        assert_eq!(response["result"]["protocolVersion"], "2025-03-26");
        assert_eq!(response["result"]["serverInfo"]["name"], "toolbridge");
        assert_eq!(
            response["result"]["capabilities"]["tools"]["listChanged"],
            true
        );

        // Unsupported version falls back.
        let response = roundtrip(
            &dispatcher,
            &conn,
            r#"{"jsonrpc":"2.0","id":2,"method":"initialize","params":{"protocolVersion":"1999-01-01"}}"#,
        )
        .await;
        assert_eq!(response["result"]["protocolVersion"], "2024-11-05");
    }

    #[tokio::test]
    async fn test_tools_list_shape() {
        let (dispatcher, sessions) = test_dispatcher(LimitsConfig::default());
        let conn = http_conn(&sessions);
        let response = roundtrip(
            &dispatcher,
            &conn,
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#,
        )
        .await;
        let tools = response["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 4);
        assert!(tools.iter().any(|t| t["name"] == "echo"));
        assert!(tools.iter().all(|t| t.get("inputSchema").is_some()));
    }

    #[tokio::test]
    async fn test_tools_call_success() {
        let (dispatcher, sessions) = test_dispatcher(LimitsConfig::default());
        let conn = http_conn(&sessions);
        let response = roundtrip(
            &dispatcher,
            &conn,
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"echo","arguments":{"x":"hi"}}}"#,
        )
        .await;
        assert_eq!(response["result"]["content"], "hi");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_method_not_found() {
        let (dispatcher, sessions) = test_dispatcher(LimitsConfig::default());
        let conn = http_conn(&sessions);
        let response = roundtrip(
            &dispatcher,
            &conn,
            r#"{"jsonrpc":"2.0","id":9,"method":"tools/call","params":{"name":"does_not_exist","arguments":{}}}"#,
        )
        .await;
        assert_eq!(response["error"]["code"], -32601);
        assert_eq!(response["error"]["message"], "Method not found");
        assert_eq!(response["error"]["data"]["tool"], "does_not_exist");
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (dispatcher, sessions) = test_dispatcher(LimitsConfig::default());
        let conn = http_conn(&sessions);
        let response = roundtrip(
            &dispatcher,
            &conn,
            r#"{"jsonrpc":"2.0","id":1,"method":"no/such/method"}"#,
        )
        .await;
        assert_eq!(response["error"]["code"], -32601);
        assert!(response["error"]["data"]["tool"].is_null());
    }

    #[tokio::test]
    async fn test_schema_violation_is_invalid_params() {
        let (dispatcher, sessions) = test_dispatcher(LimitsConfig::default());
        let conn = http_conn(&sessions);
        let response = roundtrip(
            &dispatcher,
            &conn,
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"echo","arguments":{"x":7}}}"#,
        )
        .await;
        assert_eq!(response["error"]["code"], -32602);
        let details = response["error"]["data"]["details"].as_array().unwrap();
        assert!(!details.is_empty());
    }

    #[tokio::test]
    async fn test_declared_tool_error_maps_to_32002() {
        let (dispatcher, sessions) = test_dispatcher(LimitsConfig::default());
        let conn = http_conn(&sessions);
        let response = roundtrip(
            &dispatcher,
            &conn,
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"fail","arguments":{}}}"#,
        )
        .await;
        assert_eq!(response["error"]["code"], -32002);
        assert_eq!(response["error"]["data"]["tool"], "fail");
        assert_eq!(response["error"]["data"]["kind"], "io");
    }

    #[tokio::test]
    async fn test_tool_panic_maps_to_32603() {
        let (dispatcher, sessions) = test_dispatcher(LimitsConfig::default());
        let conn = http_conn(&sessions);
        let response = roundtrip(
            &dispatcher,
            &conn,
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"panic","arguments":{}}}"#,
        )
        .await;
        assert_eq!(response["error"]["code"], -32603);
        // No stack traces leak.
        assert!(response["error"]["data"]["details"].is_null());
    }

    #[tokio::test]
    async fn test_timeout_maps_to_32003() {
        let limits = LimitsConfig {
            request_timeout: Duration::from_millis(100),
            ..LimitsConfig::default()
        };
        let (dispatcher, sessions) = test_dispatcher(limits);
        let conn = http_conn(&sessions);
        let response = roundtrip(
            &dispatcher,
            &conn,
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"sleep","arguments":{"ms":5000}}}"#,
        )
        .await;
        assert_eq!(response["error"]["code"], -32003);
        assert_eq!(response["error"]["data"]["tool"], "sleep");
    }

    #[tokio::test]
    async fn test_client_timeout_is_honored() {
        let (dispatcher, sessions) = test_dispatcher(LimitsConfig::default());
        let conn = http_conn(&sessions);
        let started = Instant::now();
        let response = roundtrip(
            &dispatcher,
            &conn,
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"sleep","arguments":{"ms":5000},"_meta":{"timeoutMs":100}}}"#,
        )
        .await;
        assert_eq!(response["error"]["code"], -32003);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_notification_produces_no_response() {
        let (dispatcher, sessions) = test_dispatcher(LimitsConfig::default());
        let conn = http_conn(&sessions);
        let out = dispatcher
            .dispatch_frame(
                conn,
                None,
                br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            )
            .await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_unknown_method_notification_is_silent() {
        let (dispatcher, sessions) = test_dispatcher(LimitsConfig::default());
        let conn = http_conn(&sessions);
        let out = dispatcher
            .dispatch_frame(conn, None, br#"{"jsonrpc":"2.0","method":"nope"}"#)
            .await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_batch_mixed_notification_suppressed() {
        let (dispatcher, sessions) = test_dispatcher(LimitsConfig::default());
        let conn = http_conn(&sessions);
        let out = dispatcher
            .dispatch_frame(
                conn,
                None,
                br#"[{"jsonrpc":"2.0","id":1,"method":"ping"},{"jsonrpc":"2.0","method":"ping"}]"#,
            )
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&crate::protocol::encode(&out)).unwrap();
        let responses = value.as_array().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], 1);
    }

    #[tokio::test]
    async fn test_batch_invalid_element_gets_null_id_error() {
        let (dispatcher, sessions) = test_dispatcher(LimitsConfig::default());
        let conn = http_conn(&sessions);
        let out = dispatcher
            .dispatch_frame(
                conn,
                None,
                br#"[{"jsonrpc":"2.0","id":1,"method":"ping"},{"nope":1}]"#,
            )
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&crate::protocol::encode(&out)).unwrap();
        let responses = value.as_array().unwrap();
        assert_eq!(responses.len(), 2);
        let invalid = responses.iter().find(|r| r.get("error").is_some()).unwrap();
        assert_eq!(invalid["id"], Value::Null);
        assert_eq!(invalid["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn test_all_notification_batch_yields_nothing() {
        let (dispatcher, sessions) = test_dispatcher(LimitsConfig::default());
        let conn = http_conn(&sessions);
        let out = dispatcher
            .dispatch_frame(
                conn,
                None,
                br#"[{"jsonrpc":"2.0","method":"ping"},{"jsonrpc":"2.0","method":"ping"}]"#,
            )
            .await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_parse_error_frame() {
        let (dispatcher, sessions) = test_dispatcher(LimitsConfig::default());
        let conn = http_conn(&sessions);
        let response = roundtrip(&dispatcher, &conn, "{not json").await;
        assert_eq!(response["error"]["code"], -32700);
        assert_eq!(response["id"], Value::Null);
    }

    #[tokio::test]
    async fn test_backpressure_with_single_slot() {
        let limits = LimitsConfig {
            global_inflight: 1,
            queue_depth: 1,
            ..LimitsConfig::default()
        };
        let (dispatcher, sessions) = test_dispatcher(limits);
        let dispatcher = Arc::new(dispatcher);
        let conn = http_conn(&sessions);

        // Occupy the only slot.
        let d1 = dispatcher.clone();
        let c1 = conn.clone();
        let holder = tokio::spawn(async move {
            d1.dispatch_frame(
                c1,
                None,
                br#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"sleep","arguments":{"ms":2000}}}"#,
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Fill the queue.
        let d2 = dispatcher.clone();
        let c2 = conn.clone();
        let queued = tokio::spawn(async move {
            d2.dispatch_frame(
                c2,
                None,
                br#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"sleep","arguments":{"ms":1}}}"#,
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Queue full: immediate -32004.
        let response = roundtrip(
            &dispatcher,
            &conn,
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"sleep","arguments":{"ms":1}}}"#,
        )
        .await;
        assert_eq!(response["error"]["code"], -32004);

        holder.abort();
        queued.abort();
    }

    #[tokio::test]
    async fn test_cancellation_on_disconnect() {
        let (dispatcher, sessions) = test_dispatcher(LimitsConfig::default());
        let dispatcher = Arc::new(dispatcher);
        let conn = http_conn(&sessions);

        let d = dispatcher.clone();
        let c = conn.clone();
        let call = tokio::spawn(async move {
            d.dispatch_frame(
                c,
                None,
                br#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"sleep","arguments":{"ms":30000}}}"#,
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(conn.pending_count(), 1);

        // Simulate client disconnect.
        sessions.close(&conn, "peer closed");

        let out = call.await.unwrap().unwrap();
        let value: Value = serde_json::from_slice(&crate::protocol::encode(&out)).unwrap();
        assert_eq!(value["error"]["code"], -32005);
        assert_eq!(conn.pending_count(), 0);

        // Slot was released.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatcher.available_slots(), 200);
    }

    #[tokio::test]
    async fn test_explicit_cancel_notification() {
        let (dispatcher, sessions) = test_dispatcher(LimitsConfig::default());
        let dispatcher = Arc::new(dispatcher);
        let conn = http_conn(&sessions);

        let d = dispatcher.clone();
        let c = conn.clone();
        let call = tokio::spawn(async move {
            d.dispatch_frame(
                c,
                None,
                br#"{"jsonrpc":"2.0","id":"slow-1","method":"tools/call","params":{"name":"sleep","arguments":{"ms":30000}}}"#,
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let out = dispatcher
            .dispatch_frame(
                conn.clone(),
                None,
                br#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":"slow-1"}}"#,
            )
            .await;
        assert!(out.is_none());

        let out = call.await.unwrap().unwrap();
        let value: Value = serde_json::from_slice(&crate::protocol::encode(&out)).unwrap();
        assert_eq!(value["error"]["code"], -32005);
    }

    #[tokio::test]
    async fn test_refuse_new_work() {
        let (dispatcher, sessions) = test_dispatcher(LimitsConfig::default());
        let conn = http_conn(&sessions);
        dispatcher.refuse_new_work();
        let response = roundtrip(
            &dispatcher,
            &conn,
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"echo","arguments":{"x":"hi"}}}"#,
        )
        .await;
        assert_eq!(response["error"]["code"], -32004);
    }
}
