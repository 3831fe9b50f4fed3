//! Request shape validation middleware.
//!
//! Defense in depth behind the frame codec: re-checks the shape of the
//! request and, for `tools/call`, that `name` is a well-formed tool
//! name and `arguments` is an object.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use super::{Middleware, Next, RequestCtx};
use crate::error::BridgeError;
use crate::protocol::ParsedRequest;

static TOOL_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.-]*$").expect("valid pattern"));

/// Re-validates request shape; short-circuits on failure.
pub struct ValidationMiddleware;

#[async_trait]
impl Middleware for ValidationMiddleware {
    fn name(&self) -> &'static str {
        "validation"
    }

    async fn handle(
        &self,
        ctx: RequestCtx,
        req: ParsedRequest,
        next: Next<'_>,
    ) -> Result<Value, BridgeError> {
        if req.method.is_empty() {
            return Err(BridgeError::InvalidRequest {
                details: "method must be non-empty".to_string(),
            });
        }
        if let Some(params) = &req.params {
            if !params.is_object() && !params.is_array() {
                return Err(BridgeError::InvalidRequest {
                    details: "params must be an object or array".to_string(),
                });
            }
        }

        if req.method == "tools/call" {
            validate_tool_call(req.params.as_ref())?;
        }

        next.run(ctx, req).await
    }
}

fn validate_tool_call(params: Option<&Value>) -> Result<(), BridgeError> {
    let params = params
        .and_then(Value::as_object)
        .ok_or_else(|| BridgeError::InvalidParams {
            violations: vec!["params must be an object".to_string()],
        })?;

    let mut violations = Vec::new();
    match params.get("name").and_then(Value::as_str) {
        Some(name) if TOOL_NAME_RE.is_match(name) => {}
        Some(name) => violations.push(format!("'name': invalid tool name '{}'", name)),
        None => violations.push("missing required property 'name'".to_string()),
    }
    if let Some(arguments) = params.get("arguments") {
        if !arguments.is_object() {
            violations.push("'arguments': expected object".to_string());
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(BridgeError::InvalidParams { violations })
    }
}
