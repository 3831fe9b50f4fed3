//! Metrics-recording middleware. Never transforms, never blocks.

use async_trait::async_trait;
use serde_json::Value;

use super::{Middleware, Next, RequestCtx};
use crate::error::BridgeError;
use crate::metrics::get_metrics;
use crate::protocol::ParsedRequest;

/// Records request counters and latency histograms.
pub struct MetricsMiddleware;

#[async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn handle(
        &self,
        ctx: RequestCtx,
        req: ParsedRequest,
        next: Next<'_>,
    ) -> Result<Value, BridgeError> {
        let method = req.method.clone();
        let started = std::time::Instant::now();

        let result = next.run(ctx, req).await;

        if let Some(metrics) = get_metrics() {
            let outcome = match &result {
                Ok(_) => "ok",
                Err(error) => error.error_type_name(),
            };
            metrics.record_request(&method, outcome, started.elapsed().as_secs_f64());
        }

        result
    }
}
