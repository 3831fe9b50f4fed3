//! Authentication middleware and the pluggable `Authenticator` hook.
//!
//! The core defines only the hook and the error code; concrete policy
//! is a plug-in. The static-token implementation below serves simple
//! deployments and the test suite.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use super::{Middleware, Next, RequestCtx};
use crate::error::BridgeError;
use crate::protocol::ParsedRequest;

/// Credential validator plug-in point.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Validate the transport-provided credential.
    ///
    /// `credential` is whatever the transport extracted: the
    /// `Authorization` header value for HTTP and SSE POSTs, the
    /// subprotocol token for WebSocket.
    async fn authenticate(&self, credential: Option<&str>) -> bool;
}

/// Compares the credential against a fixed bearer token.
pub struct StaticTokenAuthenticator {
    expected: String,
}

impl StaticTokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            expected: token.into(),
        }
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, credential: Option<&str>) -> bool {
        match credential {
            Some(value) => {
                let token = value.strip_prefix("Bearer ").unwrap_or(value);
                token == self.expected
            }
            None => false,
        }
    }
}

/// Rejects requests the authenticator refuses.
pub struct AuthMiddleware {
    authenticator: Arc<dyn Authenticator>,
}

impl AuthMiddleware {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self { authenticator }
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn handle(
        &self,
        ctx: RequestCtx,
        req: ParsedRequest,
        next: Next<'_>,
    ) -> Result<Value, BridgeError> {
        if !self
            .authenticator
            .authenticate(ctx.credential.as_deref())
            .await
        {
            warn!(
                connection_id = %ctx.connection.id,
                correlation_id = %req.correlation_id,
                "Credential rejected"
            );
            return Err(BridgeError::Unauthorized);
        }
        next.run(ctx, req).await
    }
}
