//! Server configuration.
//!
//! Configuration is assembled from defaults, environment variables
//! (`TOOLBRIDGE_*`), and CLI flags (see `main.rs`). Everything is
//! validated once at startup; an invalid configuration prevents the
//! server from starting at all.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// HTTP header that binds SSE POSTs to their stream.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Query parameter alternative to [`SESSION_HEADER`].
pub const SESSION_QUERY_PARAM: &str = "sessionId";

/// Errors raised by configuration validation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// A numeric setting is zero or otherwise out of range.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Name of the offending setting
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },
}

/// HTTP transport settings.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Listen address, e.g. "127.0.0.1:8080"
    pub bind: String,
    /// RPC endpoint path
    pub rpc_path: String,
    /// Maximum request body size in bytes
    pub max_request_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            rpc_path: "/rpc".to_string(),
            max_request_bytes: 1024 * 1024,
        }
    }
}

/// WebSocket transport settings.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Listen address
    pub bind: String,
    /// Upgrade endpoint path
    pub path: String,
    /// Interval between server pings
    pub ping_interval: Duration,
    /// Maximum text frame size in bytes
    pub max_message_bytes: usize,
    /// Maximum simultaneous connections
    pub max_connections: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8081".to_string(),
            path: "/ws".to_string(),
            ping_interval: Duration::from_secs(30),
            max_message_bytes: 1024 * 1024,
            max_connections: 500,
        }
    }
}

/// SSE transport settings (legacy n8n-compatible framing).
#[derive(Debug, Clone)]
pub struct SseConfig {
    /// Listen address
    pub bind: String,
    /// GET endpoint that opens the event stream
    pub stream_path: String,
    /// POST endpoint that feeds requests into a session
    pub messages_path: String,
    /// Interval between `event: ping` keepalives
    pub ping_interval: Duration,
    /// Maximum simultaneous streams
    pub max_connections: usize,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8082".to_string(),
            stream_path: "/sse".to_string(),
            messages_path: "/messages".to_string(),
            ping_interval: Duration::from_secs(30),
            max_connections: 100,
        }
    }
}

/// Dispatch concurrency limits and timeouts.
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Global in-flight tool-call limit
    pub global_inflight: usize,
    /// Default per-tool in-flight limit
    pub per_tool_default: usize,
    /// Per-tool overrides, fully-qualified name -> limit
    pub per_tool: HashMap<String, usize>,
    /// Per-tool deadline overrides, fully-qualified name -> timeout
    pub per_tool_timeout: HashMap<String, Duration>,
    /// Per-connection in-flight limit for streaming transports
    pub per_connection: usize,
    /// Depth of the bounded wait queue
    pub queue_depth: usize,
    /// Default per-request deadline
    pub request_timeout: Duration,
    /// Hard-kill ceiling as a multiple of the deadline
    pub hard_kill_factor: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            global_inflight: 200,
            per_tool_default: 32,
            per_tool: HashMap::new(),
            per_tool_timeout: HashMap::new(),
            per_connection: 32,
            queue_depth: 256,
            request_timeout: Duration::from_secs(30),
            hard_kill_factor: 2,
        }
    }
}

/// CORS settings shared by all transports.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// Allowed origins; `["*"]` allows any
    pub allow_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origins: vec!["*".to_string()],
        }
    }
}

/// Rate-limit middleware settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Whether the middleware is active
    pub enabled: bool,
    /// Sustained requests per second per key
    pub rps: u32,
    /// Burst size per key
    pub burst: u32,
    /// Idle duration after which a key's bucket is dropped
    pub stale_after: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rps: 100,
            burst: 200,
            stale_after: Duration::from_secs(300),
        }
    }
}

/// Auth middleware settings.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Whether the middleware is active
    pub enabled: bool,
    /// Static bearer token for the built-in authenticator
    pub static_token: Option<String>,
}

/// Middleware chain ordering and per-middleware settings.
#[derive(Debug, Clone)]
pub struct MiddlewareConfig {
    /// Middleware names in invocation order
    pub order: Vec<String>,
    /// Rate-limit settings
    pub rate_limit: RateLimitConfig,
    /// Auth settings
    pub auth: AuthConfig,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            order: vec![
                "logging".to_string(),
                "validation".to_string(),
                "rate_limit".to_string(),
                "auth".to_string(),
                "metrics".to_string(),
            ],
            rate_limit: RateLimitConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http: HttpConfig,
    pub ws: WsConfig,
    pub sse: SseConfig,
    pub limits: LimitsConfig,
    pub cors: CorsConfig,
    pub middleware: MiddlewareConfig,
    /// Shutdown drain window
    pub drain_timeout: Duration,
}

impl ServerConfig {
    /// Load configuration from environment variables on top of defaults.
    ///
    /// # Environment Variables
    ///
    /// - `TOOLBRIDGE_HTTP_BIND`, `TOOLBRIDGE_WS_BIND`, `TOOLBRIDGE_SSE_BIND`
    /// - `TOOLBRIDGE_RPC_PATH`, `TOOLBRIDGE_WS_PATH`,
    ///   `TOOLBRIDGE_SSE_PATH`, `TOOLBRIDGE_MESSAGES_PATH`
    /// - `TOOLBRIDGE_MAX_REQUEST_BYTES`, `TOOLBRIDGE_MAX_WS_MESSAGE_BYTES`
    /// - `TOOLBRIDGE_PING_INTERVAL_SECS`
    /// - `TOOLBRIDGE_GLOBAL_INFLIGHT`, `TOOLBRIDGE_PER_TOOL_INFLIGHT`,
    ///   `TOOLBRIDGE_PER_CONNECTION_INFLIGHT`, `TOOLBRIDGE_QUEUE_DEPTH`
    /// - `TOOLBRIDGE_PER_TOOL_LIMITS` ("name=8,other=4")
    /// - `TOOLBRIDGE_REQUEST_TIMEOUT_SECS`, `TOOLBRIDGE_HARD_KILL_FACTOR`
    /// - `TOOLBRIDGE_DRAIN_TIMEOUT_SECS`
    /// - `TOOLBRIDGE_CORS_ALLOW_ORIGINS` (comma separated)
    /// - `TOOLBRIDGE_RATE_LIMIT_ENABLED`, `TOOLBRIDGE_RATE_LIMIT_RPS`,
    ///   `TOOLBRIDGE_RATE_LIMIT_BURST`
    /// - `TOOLBRIDGE_AUTH_ENABLED`, `TOOLBRIDGE_AUTH_TOKEN`
    ///
    /// Invalid values log a warning and fall back to the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("TOOLBRIDGE_HTTP_BIND") {
            config.http.bind = v;
        }
        if let Ok(v) = std::env::var("TOOLBRIDGE_WS_BIND") {
            config.ws.bind = v;
        }
        if let Ok(v) = std::env::var("TOOLBRIDGE_SSE_BIND") {
            config.sse.bind = v;
        }
        if let Ok(v) = std::env::var("TOOLBRIDGE_RPC_PATH") {
            config.http.rpc_path = v;
        }
        if let Ok(v) = std::env::var("TOOLBRIDGE_WS_PATH") {
            config.ws.path = v;
        }
        if let Ok(v) = std::env::var("TOOLBRIDGE_SSE_PATH") {
            config.sse.stream_path = v;
        }
        if let Ok(v) = std::env::var("TOOLBRIDGE_MESSAGES_PATH") {
            config.sse.messages_path = v;
        }

        config.http.max_request_bytes = parse_env(
            "TOOLBRIDGE_MAX_REQUEST_BYTES",
            config.http.max_request_bytes,
        );
        config.ws.max_message_bytes = parse_env(
            "TOOLBRIDGE_MAX_WS_MESSAGE_BYTES",
            config.ws.max_message_bytes,
        );

        let ping = parse_duration_env(
            "TOOLBRIDGE_PING_INTERVAL_SECS",
            config.ws.ping_interval,
        );
        config.ws.ping_interval = ping;
        config.sse.ping_interval = ping;

        config.limits.global_inflight =
            parse_env("TOOLBRIDGE_GLOBAL_INFLIGHT", config.limits.global_inflight);
        config.limits.per_tool_default = parse_env(
            "TOOLBRIDGE_PER_TOOL_INFLIGHT",
            config.limits.per_tool_default,
        );
        config.limits.per_connection = parse_env(
            "TOOLBRIDGE_PER_CONNECTION_INFLIGHT",
            config.limits.per_connection,
        );
        config.limits.queue_depth = parse_env("TOOLBRIDGE_QUEUE_DEPTH", config.limits.queue_depth);
        config.limits.request_timeout = parse_duration_env(
            "TOOLBRIDGE_REQUEST_TIMEOUT_SECS",
            config.limits.request_timeout,
        );
        config.limits.hard_kill_factor = parse_env(
            "TOOLBRIDGE_HARD_KILL_FACTOR",
            config.limits.hard_kill_factor,
        );
        if let Ok(raw) = std::env::var("TOOLBRIDGE_PER_TOOL_LIMITS") {
            config.limits.per_tool = parse_per_tool_limits(&raw);
        }
        if let Ok(raw) = std::env::var("TOOLBRIDGE_PER_TOOL_TIMEOUT_SECS") {
            config.limits.per_tool_timeout = parse_per_tool_limits(&raw)
                .into_iter()
                .map(|(name, secs)| (name, Duration::from_secs(secs as u64)))
                .collect();
        }

        config.drain_timeout =
            parse_duration_env("TOOLBRIDGE_DRAIN_TIMEOUT_SECS", config.drain_timeout);

        if let Ok(v) = std::env::var("TOOLBRIDGE_CORS_ALLOW_ORIGINS") {
            config.cors.allow_origins = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        config.middleware.rate_limit.enabled = parse_bool_env(
            "TOOLBRIDGE_RATE_LIMIT_ENABLED",
            config.middleware.rate_limit.enabled,
        );
        config.middleware.rate_limit.rps =
            parse_env("TOOLBRIDGE_RATE_LIMIT_RPS", config.middleware.rate_limit.rps);
        config.middleware.rate_limit.burst = parse_env(
            "TOOLBRIDGE_RATE_LIMIT_BURST",
            config.middleware.rate_limit.burst,
        );

        config.middleware.auth.enabled =
            parse_bool_env("TOOLBRIDGE_AUTH_ENABLED", config.middleware.auth.enabled);
        if let Ok(v) = std::env::var("TOOLBRIDGE_AUTH_TOKEN") {
            config.middleware.auth.static_token = Some(v);
        }

        config
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first violation found. Callers treat any error as
    /// fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.global_inflight == 0 {
            return Err(ConfigError::InvalidValue {
                field: "limits.global_inflight",
                reason: "must be at least 1".into(),
            });
        }
        if self.limits.per_tool_default == 0 {
            return Err(ConfigError::InvalidValue {
                field: "limits.per_tool_default",
                reason: "must be at least 1".into(),
            });
        }
        if self.limits.per_connection == 0 {
            return Err(ConfigError::InvalidValue {
                field: "limits.per_connection",
                reason: "must be at least 1".into(),
            });
        }
        if self.limits.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "limits.request_timeout",
                reason: "must be non-zero".into(),
            });
        }
        if self.limits.hard_kill_factor < 1 {
            return Err(ConfigError::InvalidValue {
                field: "limits.hard_kill_factor",
                reason: "must be at least 1".into(),
            });
        }
        if self.http.max_request_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "http.max_request_bytes",
                reason: "must be non-zero".into(),
            });
        }
        if self.ws.ping_interval.is_zero() || self.sse.ping_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "ping_interval",
                reason: "must be non-zero".into(),
            });
        }
        for (tool, limit) in &self.limits.per_tool {
            if *limit == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "limits.per_tool",
                    reason: format!("limit for '{}' must be at least 1", tool),
                });
            }
        }
        for path in [
            &self.http.rpc_path,
            &self.ws.path,
            &self.sse.stream_path,
            &self.sse.messages_path,
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::InvalidValue {
                    field: "endpoint path",
                    reason: format!("'{}' must start with '/'", path),
                });
            }
        }
        if self.middleware.auth.enabled && self.middleware.auth.static_token.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "middleware.auth",
                reason: "auth enabled but no token configured".into(),
            });
        }
        Ok(())
    }

    /// Hard-kill ceiling for a given deadline.
    pub fn hard_kill_after(&self, deadline: Duration) -> Duration {
        deadline * self.limits.hard_kill_factor
    }
}

/// Parse a numeric environment variable, warning on invalid values.
fn parse_env<T: std::str::FromStr + std::fmt::Display + Copy>(var: &str, default: T) -> T {
    match std::env::var(var) {
        Ok(value) => match value.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    var = var,
                    value = %value,
                    default = %default,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

/// Parse a seconds-valued duration environment variable.
fn parse_duration_env(var: &str, default: Duration) -> Duration {
    match std::env::var(var) {
        Ok(value) => match value.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => {
                warn!(
                    var = var,
                    value = %value,
                    default_secs = default.as_secs(),
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

/// Parse a boolean environment variable ("true"/"1" are truthy).
fn parse_bool_env(var: &str, default: bool) -> bool {
    std::env::var(var)
        .ok()
        .map(|s| s.eq_ignore_ascii_case("true") || s == "1")
        .unwrap_or(default)
}

/// Parse a "name=limit,name=limit" per-tool override list.
fn parse_per_tool_limits(raw: &str) -> HashMap<String, usize> {
    let mut limits = HashMap::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match entry.split_once('=') {
            Some((name, value)) => match value.parse::<usize>() {
                Ok(limit) => {
                    limits.insert(name.trim().to_string(), limit);
                }
                Err(_) => {
                    warn!(entry = entry, "Ignoring malformed per-tool limit entry");
                }
            },
            None => {
                warn!(entry = entry, "Ignoring malformed per-tool limit entry");
            }
        }
    }
    limits
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            ws: WsConfig::default(),
            sse: SseConfig::default(),
            limits: LimitsConfig::default(),
            cors: CorsConfig::default(),
            middleware: MiddlewareConfig::default(),
            drain_timeout: Duration::from_secs(25),
        }
    }
}
