//! Transport adapters.
//!
//! Three adapters share one dispatcher: request/response HTTP,
//! bidirectional WebSocket, and the legacy SSE+POST pair. Each turns
//! wire bytes into frames for [`crate::dispatch::Dispatcher`] and
//! manages its own connection state; transports never reach into each
//! other.

pub mod http;
pub mod sse;
pub mod ws;

use axum::http::{header, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::config::{CorsConfig, SESSION_HEADER};

/// CORS layer shared by every transport.
///
/// Preflight allows GET/POST/OPTIONS and the usual request headers; the
/// session header is exposed on responses so browser clients can read
/// it (HTTP carries it too for parity with SSE).
pub fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            header::CACHE_CONTROL,
            header::HeaderName::from_static("mcp-session-id"),
        ])
        .expose_headers([header::HeaderName::from_static("mcp-session-id")]);

    if config.allow_origins.iter().any(|origin| origin == "*") {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .allow_origins
            .iter()
            .filter_map(|origin| match origin.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin = %origin, "Ignoring unparseable CORS origin");
                    None
                }
            })
            .collect();
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

/// Extract the credential slot from request headers.
pub(crate) fn extract_credential(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(String::from)
}

/// Extract the session id from a query string or the session header.
pub(crate) fn extract_session_id(
    query: Option<&str>,
    headers: &axum::http::HeaderMap,
) -> Option<String> {
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                if key == crate::config::SESSION_QUERY_PARAM {
                    return Some(value.to_string());
                }
            }
        }
    }
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    #[test]
    fn test_extract_credential() {
        let mut headers = HeaderMap::new();
        assert!(extract_credential(&headers).is_none());
        headers.insert(header::AUTHORIZATION, "Bearer tok".parse().unwrap());
        assert_eq!(extract_credential(&headers).as_deref(), Some("Bearer tok"));
    }

    #[test]
    fn test_extract_session_id_from_query() {
        let headers = HeaderMap::new();
        assert_eq!(
            extract_session_id(Some("sessionId=abc-123"), &headers).as_deref(),
            Some("abc-123")
        );
        assert_eq!(
            extract_session_id(Some("foo=1&sessionId=xyz"), &headers).as_deref(),
            Some("xyz")
        );
        assert!(extract_session_id(Some("foo=1"), &headers).is_none());
    }

    #[test]
    fn test_extract_session_id_header_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, "sid-9".parse().unwrap());
        assert_eq!(
            extract_session_id(None, &headers).as_deref(),
            Some("sid-9")
        );
        // Query parameter wins over the header.
        assert_eq!(
            extract_session_id(Some("sessionId=q"), &headers).as_deref(),
            Some("q")
        );
    }
}
