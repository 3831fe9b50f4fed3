//! Request/response logging middleware.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{Middleware, Next, RequestCtx};
use crate::error::BridgeError;
use crate::protocol::ParsedRequest;

/// Logs method, ids, elapsed time, and outcome. Never transforms.
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn handle(
        &self,
        ctx: RequestCtx,
        req: ParsedRequest,
        next: Next<'_>,
    ) -> Result<Value, BridgeError> {
        let method = req.method.clone();
        let correlation_id = req.correlation_id;
        let connection_id = ctx.connection.id;
        let started = std::time::Instant::now();

        debug!(
            correlation_id = %correlation_id,
            connection_id = %connection_id,
            method = %method,
            "Request started"
        );

        let result = next.run(ctx, req).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(
                correlation_id = %correlation_id,
                connection_id = %connection_id,
                method = %method,
                elapsed_ms,
                outcome = "ok",
                "Request completed"
            ),
            Err(error) => warn!(
                correlation_id = %correlation_id,
                connection_id = %connection_id,
                method = %method,
                elapsed_ms,
                outcome = error.error_type_name(),
                code = error.to_jsonrpc_code(),
                "Request failed"
            ),
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{MiddlewareChain, TerminalFn};
    use crate::session::{ConnectionRegistry, OutboundSink, TransportKind};
    use std::sync::Arc;
    use std::time::Instant;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_logging_passes_result_through() {
        let registry = ConnectionRegistry::new();
        let connection = registry.open(TransportKind::Http, None, OutboundSink::Http, 1);
        let cancel = connection.cancel.child_token();
        let ctx = RequestCtx {
            connection,
            credential: None,
            cancel,
        };
        let req = ParsedRequest {
            id: Some(crate::protocol::JsonRpcId::Number(1)),
            method: "ping".into(),
            params: None,
            client_timeout: None,
            received_at: Instant::now(),
            correlation_id: Uuid::new_v4(),
        };

        let mut chain = MiddlewareChain::new();
        chain.push(Arc::new(LoggingMiddleware));
        let terminal: Box<TerminalFn> =
            Box::new(|_ctx, _req| Box::pin(async { Ok(serde_json::json!({"pong": true})) }));

        let result = chain.process(ctx, req, terminal.as_ref()).await.unwrap();
        assert_eq!(result["pong"], true);
    }
}
