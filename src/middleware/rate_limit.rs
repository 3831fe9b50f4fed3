//! Per-client rate limiting using the GCRA algorithm.
//!
//! Each peer IP gets its own limiter, created lazily on first request,
//! so the bucket survives one-shot HTTP connections and spans all of a
//! client's sessions. Transports with no peer address share the
//! "default" bucket. Stale entries are periodically removed to bound
//! memory. On exhaustion the request short-circuits with a
//! backpressure error.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorLimiter};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{Middleware, Next, RequestCtx};
use crate::config::RateLimitConfig;
use crate::error::BridgeError;
use crate::protocol::ParsedRequest;

type KeyLimiter = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

struct RateLimitEntry {
    limiter: KeyLimiter,
    last_seen: Instant,
}

/// Token-bucket rate limiter keyed by peer IP.
pub struct RateLimitMiddleware {
    limiters: Arc<DashMap<String, RateLimitEntry>>,
    quota: Quota,
    stale_after: Duration,
}

/// Bucket key for a connection: the peer IP, or "default" when the
/// transport did not record one.
fn bucket_key(connection: &crate::session::Connection) -> String {
    connection
        .remote_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "default".to_string())
}

impl RateLimitMiddleware {
    pub fn new(config: RateLimitConfig) -> Self {
        let burst = NonZeroU32::new(config.burst)
            .unwrap_or_else(|| NonZeroU32::new(200).expect("non-zero literal"));
        let quota = Quota::per_second(
            NonZeroU32::new(config.rps)
                .unwrap_or_else(|| NonZeroU32::new(100).expect("non-zero literal")),
        )
        .allow_burst(burst);

        info!(
            rps = config.rps,
            burst = config.burst,
            stale_secs = config.stale_after.as_secs(),
            "Rate limiter configured"
        );

        Self {
            limiters: Arc::new(DashMap::new()),
            quota,
            stale_after: config.stale_after,
        }
    }

    /// Check whether a request under `key` is allowed.
    pub fn check(&self, key: &str) -> bool {
        let mut entry = self
            .limiters
            .entry(key.to_string())
            .or_insert_with(|| RateLimitEntry {
                limiter: GovernorLimiter::direct(self.quota),
                last_seen: Instant::now(),
            });
        entry.last_seen = Instant::now();
        entry.limiter.check().is_ok()
    }

    /// Remove entries idle for longer than `stale_after`.
    pub fn cleanup_stale(&self) -> usize {
        let cutoff = Instant::now() - self.stale_after;
        let before = self.limiters.len();
        self.limiters.retain(|_, entry| entry.last_seen > cutoff);
        let removed = before - self.limiters.len();
        if removed > 0 {
            debug!(removed, remaining = self.limiters.len(), "Cleaned stale rate buckets");
        }
        removed
    }

    /// Number of tracked keys.
    pub fn tracked_keys(&self) -> usize {
        self.limiters.len()
    }

    /// Periodically clean stale entries until `shutdown` fires.
    pub fn spawn_cleanup_task(self: &Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        let limiter = Arc::clone(self);
        let interval = limiter.stale_after / 2;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval.max(Duration::from_secs(1)));
            tick.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        limiter.cleanup_stale();
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Rate limiter cleanup task shutting down");
                        break;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn handle(
        &self,
        ctx: RequestCtx,
        req: ParsedRequest,
        next: Next<'_>,
    ) -> Result<Value, BridgeError> {
        let key = bucket_key(&ctx.connection);
        if !self.check(&key) {
            warn!(
                connection_id = %ctx.connection.id,
                correlation_id = %req.correlation_id,
                key = %key,
                "Rate limit exceeded"
            );
            return Err(BridgeError::ServerBusy);
        }
        next.run(ctx, req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rps: u32, burst: u32) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            rps,
            burst,
            stale_after: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_first_request_allowed() {
        let limiter = RateLimitMiddleware::new(config(10, 10));
        assert!(limiter.check("conn-1"));
    }

    #[test]
    fn test_rejects_after_burst() {
        let limiter = RateLimitMiddleware::new(config(1, 3));
        assert!(limiter.check("conn-1"));
        assert!(limiter.check("conn-1"));
        assert!(limiter.check("conn-1"));
        assert!(!limiter.check("conn-1"));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimitMiddleware::new(config(1, 2));
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));

        assert!(limiter.check("b"));
        assert!(limiter.check("b"));
        assert!(!limiter.check("b"));
    }

    #[test]
    fn test_cleanup_removes_stale() {
        let limiter = RateLimitMiddleware::new(RateLimitConfig {
            enabled: true,
            rps: 10,
            burst: 10,
            stale_after: Duration::ZERO,
        });
        limiter.check("a");
        assert_eq!(limiter.tracked_keys(), 1);
        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(limiter.cleanup_stale(), 1);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_cleanup_retains_active() {
        let limiter = RateLimitMiddleware::new(config(10, 10));
        limiter.check("a");
        assert_eq!(limiter.cleanup_stale(), 0);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_bucket_key_is_stable_across_connections() {
        use crate::session::{ConnectionRegistry, OutboundSink, TransportKind};

        // Two one-shot connections from the same peer share one bucket.
        let registry = ConnectionRegistry::new();
        let peer = "10.0.0.1:50001".parse().ok();
        let first = registry.open(TransportKind::Http, peer, OutboundSink::Http, 1);
        let peer = "10.0.0.1:50002".parse().ok();
        let second = registry.open(TransportKind::Http, peer, OutboundSink::Http, 1);

        assert_ne!(first.id, second.id);
        assert_eq!(bucket_key(&first), "10.0.0.1");
        assert_eq!(bucket_key(&first), bucket_key(&second));
    }

    #[test]
    fn test_bucket_key_falls_back_to_default() {
        use crate::session::{ConnectionRegistry, OutboundSink, TransportKind};

        let registry = ConnectionRegistry::new();
        let connection = registry.open(TransportKind::Http, None, OutboundSink::Http, 1);
        assert_eq!(bucket_key(&connection), "default");
    }
}
