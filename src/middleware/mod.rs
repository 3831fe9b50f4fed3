//! Middleware chain for request processing.
//!
//! A middleware sees `(ctx, req, next)` and may short-circuit by
//! returning without calling `next`, transform the request on the way
//! in, or transform the result on the way out. The chain runs in
//! configured order inbound and unwinds in reverse order outbound.
//!
//! Middlewares own their state (rate-limit buckets, counters) in
//! concurrency-safe containers; nothing else is shared.

pub mod auth;
pub mod logging;
pub mod metrics;
pub mod rate_limit;
pub mod validation;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::config::MiddlewareConfig;
use crate::error::BridgeError;
use crate::protocol::ParsedRequest;
use crate::session::Connection;

pub use auth::{Authenticator, StaticTokenAuthenticator};

/// Per-request context threaded through the chain.
#[derive(Clone)]
pub struct RequestCtx {
    /// The originating connection
    pub connection: Arc<Connection>,
    /// Credential extracted by the transport (e.g. Authorization header)
    pub credential: Option<String>,
    /// Request-scoped cancellation token (child of the connection's)
    pub cancel: tokio_util::sync::CancellationToken,
}

/// The rest of the chain after the current middleware.
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    terminal: &'a TerminalFn,
}

/// The handler at the end of the chain (the dispatcher).
pub type TerminalFn =
    dyn Fn(RequestCtx, ParsedRequest) -> BoxFuture<'static, Result<Value, BridgeError>>
        + Send
        + Sync;

impl<'a> Next<'a> {
    /// Invoke the remainder of the chain.
    pub async fn run(self, ctx: RequestCtx, req: ParsedRequest) -> Result<Value, BridgeError> {
        match self.middlewares.split_first() {
            Some((first, rest)) => {
                let next = Next {
                    middlewares: rest,
                    terminal: self.terminal,
                };
                first.handle(ctx, req, next).await
            }
            None => (self.terminal)(ctx, req).await,
        }
    }
}

/// A composable request transformer.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in configuration and logs.
    fn name(&self) -> &'static str;

    /// Process a request.
    ///
    /// Implementations short-circuit by returning without calling
    /// `next.run`.
    async fn handle(
        &self,
        ctx: RequestCtx,
        req: ParsedRequest,
        next: Next<'_>,
    ) -> Result<Value, BridgeError>;
}

/// An ordered middleware chain.
#[derive(Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    /// Empty chain; `process` goes straight to the terminal handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware.
    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    /// Names in invocation order.
    pub fn names(&self) -> Vec<&'static str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    /// Run a request through the chain into `terminal`.
    pub async fn process(
        &self,
        ctx: RequestCtx,
        req: ParsedRequest,
        terminal: &TerminalFn,
    ) -> Result<Value, BridgeError> {
        Next {
            middlewares: &self.middlewares,
            terminal,
        }
        .run(ctx, req)
        .await
    }
}

/// Assemble the chain from configuration.
///
/// Unknown names in the configured order are skipped with a warning;
/// rate-limit and auth are only instantiated when enabled.
pub fn build_chain(
    config: &MiddlewareConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
    shutdown: tokio_util::sync::CancellationToken,
) -> MiddlewareChain {
    let mut chain = MiddlewareChain::new();
    for name in &config.order {
        match name.as_str() {
            "logging" => chain.push(Arc::new(logging::LoggingMiddleware)),
            "validation" => chain.push(Arc::new(validation::ValidationMiddleware)),
            "rate_limit" => {
                if config.rate_limit.enabled {
                    let limiter = Arc::new(rate_limit::RateLimitMiddleware::new(
                        config.rate_limit.clone(),
                    ));
                    limiter.spawn_cleanup_task(shutdown.clone());
                    chain.push(limiter);
                }
            }
            "auth" => {
                if config.auth.enabled {
                    if let Some(authenticator) = authenticator.clone() {
                        chain.push(Arc::new(auth::AuthMiddleware::new(authenticator)));
                    }
                }
            }
            "metrics" => chain.push(Arc::new(metrics::MetricsMiddleware)),
            other => {
                tracing::warn!(middleware = other, "Unknown middleware in configured order");
            }
        }
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ConnectionRegistry, OutboundSink, TransportKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use uuid::Uuid;

    fn test_ctx() -> RequestCtx {
        let registry = ConnectionRegistry::new();
        let connection = registry.open(TransportKind::Http, None, OutboundSink::Http, 1);
        let cancel = connection.cancel.child_token();
        RequestCtx {
            connection,
            credential: None,
            cancel,
        }
    }

    fn test_req(method: &str) -> ParsedRequest {
        ParsedRequest {
            id: Some(crate::protocol::JsonRpcId::Number(1)),
            method: method.to_string(),
            params: None,
            client_timeout: None,
            received_at: Instant::now(),
            correlation_id: Uuid::new_v4(),
        }
    }

    fn ok_terminal() -> Box<TerminalFn> {
        Box::new(|_ctx, _req| Box::pin(async { Ok(serde_json::json!({"ok": true})) }))
    }

    /// Records the order it was entered and exited in.
    struct Tracer {
        label: &'static str,
        log: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Tracer {
        fn name(&self) -> &'static str {
            self.label
        }

        async fn handle(
            &self,
            ctx: RequestCtx,
            req: ParsedRequest,
            next: Next<'_>,
        ) -> Result<Value, BridgeError> {
            self.log.lock().unwrap().push(format!("{}:in", self.label));
            let result = next.run(ctx, req).await;
            self.log.lock().unwrap().push(format!("{}:out", self.label));
            result
        }
    }

    #[tokio::test]
    async fn test_onion_ordering() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut chain = MiddlewareChain::new();
        chain.push(Arc::new(Tracer {
            label: "outer",
            log: log.clone(),
        }));
        chain.push(Arc::new(Tracer {
            label: "inner",
            log: log.clone(),
        }));

        let terminal = ok_terminal();
        chain
            .process(test_ctx(), test_req("ping"), terminal.as_ref())
            .await
            .unwrap();

        let entries = log.lock().unwrap().clone();
        assert_eq!(entries, vec!["outer:in", "inner:in", "inner:out", "outer:out"]);
    }

    struct ShortCircuit;

    #[async_trait]
    impl Middleware for ShortCircuit {
        fn name(&self) -> &'static str {
            "short_circuit"
        }

        async fn handle(
            &self,
            _ctx: RequestCtx,
            _req: ParsedRequest,
            _next: Next<'_>,
        ) -> Result<Value, BridgeError> {
            Err(BridgeError::Unauthorized)
        }
    }

    #[tokio::test]
    async fn test_short_circuit_skips_terminal() {
        let reached = Arc::new(AtomicUsize::new(0));
        let reached_clone = reached.clone();
        let terminal: Box<TerminalFn> = Box::new(move |_ctx, _req| {
            reached_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(Value::Null) })
        });

        let mut chain = MiddlewareChain::new();
        chain.push(Arc::new(ShortCircuit));

        let result = chain
            .process(test_ctx(), test_req("ping"), terminal.as_ref())
            .await;
        assert_eq!(result, Err(BridgeError::Unauthorized));
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_chain_reaches_terminal() {
        let chain = MiddlewareChain::new();
        let terminal = ok_terminal();
        let result = chain
            .process(test_ctx(), test_req("ping"), terminal.as_ref())
            .await
            .unwrap();
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn test_build_chain_respects_config() {
        let mut config = MiddlewareConfig::default();
        // rate_limit and auth disabled by default
        let chain = build_chain(&config, None, tokio_util::sync::CancellationToken::new());
        assert_eq!(chain.names(), vec!["logging", "validation", "metrics"]);

        config.rate_limit.enabled = true;
        config.auth.enabled = true;
        let authenticator: Arc<dyn Authenticator> =
            Arc::new(StaticTokenAuthenticator::new("secret"));
        let chain = build_chain(
            &config,
            Some(authenticator),
            tokio_util::sync::CancellationToken::new(),
        );
        assert_eq!(
            chain.names(),
            vec!["logging", "validation", "rate_limit", "auth", "metrics"]
        );
    }
}
