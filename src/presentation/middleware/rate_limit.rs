//! Rate Limiting Middleware
//!
//! Applies the in-memory sliding window limiters to HTTP routes:
//! administrative routes are keyed by the authenticated admin, public
//! routes (health, metrics) by client address.

use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::application::services::{RateLimitInfo, SlidingWindowLimiter};
use crate::presentation::middleware::auth::AuthUser;
use crate::shared::error::ErrorResponse;
use crate::startup::AppState;

// ============================================================================
// Rate Limit Response
// ============================================================================

/// Rate limit exceeded error response.
#[derive(Debug, Serialize)]
struct RateLimitExceededResponse {
    #[serde(flatten)]
    error: ErrorResponse,
    rate_limit: RateLimitInfo,
}

// ============================================================================
// Identifier Extraction
// ============================================================================

/// Peer address recorded by `into_make_service_with_connect_info`. Absent
/// when the router is driven without a socket, as in `oneshot` tests.
fn client_ip(request: &Request) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
}

/// Extract the rate limit identifier from a request.
///
/// Priority:
/// 1. Authenticated user ID
/// 2. X-Forwarded-For / X-Real-IP, only when `trust_proxy_headers` is set
/// 3. Connection IP address
///
/// Forwarding headers are client-controlled unless a trusted proxy
/// overwrites them, so they are ignored by default.
fn extract_identifier(request: &Request, client_ip: Option<IpAddr>, trust_proxy_headers: bool) -> String {
    if let Some(auth_user) = request.extensions().get::<AuthUser>() {
        return format!("user:{}", auth_user.user_id);
    }

    if trust_proxy_headers {
        // First IP in the chain is the original client
        if let Some(ip) = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.split(',').next())
            .and_then(|ip| ip.trim().parse::<IpAddr>().ok())
        {
            return format!("ip:{}", ip);
        }

        if let Some(ip) = request
            .headers()
            .get("x-real-ip")
            .and_then(|h| h.to_str().ok())
            .and_then(|ip| ip.trim().parse::<IpAddr>().ok())
        {
            return format!("ip:{}", ip);
        }
    }

    match client_ip {
        Some(ip) => format!("ip:{}", ip),
        None => {
            tracing::warn!("Could not determine client identifier for rate limiting");
            "ip:unknown".to_string()
        }
    }
}

// ============================================================================
// Middleware Functions
// ============================================================================

/// Rate limiting for administrative routes. Runs after authentication so
/// the admin's user id is the key.
pub async fn rate_limit_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let limiter = state.limiters.admin.clone();
    rate_limit_inner(&state, &limiter, request, next).await
}

/// Rate limiting for public endpoints, keyed by client address.
pub async fn rate_limit_public(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let limiter = state.limiters.public.clone();
    rate_limit_inner(&state, &limiter, request, next).await
}

async fn rate_limit_inner(
    state: &AppState,
    limiter: &SlidingWindowLimiter,
    request: Request,
    next: Next,
) -> Response {
    let identifier = extract_identifier(
        &request,
        client_ip(&request),
        state.settings.rate_limit.trust_proxy_headers,
    );

    match limiter.check(&identifier) {
        Ok(info) => {
            let mut response = next.run(request).await;
            add_rate_limit_headers(response.headers_mut(), &info);
            response
        }
        Err(info) => {
            // Expected under load; not an error
            tracing::debug!(
                identifier = %identifier,
                limiter = limiter.name(),
                retry_after = info.retry_after,
                "Rate limit exceeded"
            );
            create_rate_limit_response(info)
        }
    }
}

/// Add rate limit headers to a response.
fn add_rate_limit_headers(headers: &mut header::HeaderMap, info: &RateLimitInfo) {
    if let Ok(v) = header::HeaderValue::from_str(&info.limit.to_string()) {
        headers.insert("X-RateLimit-Limit", v);
    }
    if let Ok(v) = header::HeaderValue::from_str(&info.remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", v);
    }
}

/// Create a 429 Too Many Requests response. Retry-After is in whole
/// seconds and never zero.
fn create_rate_limit_response(info: RateLimitInfo) -> Response {
    let retry_after = info.retry_after.max(1);
    let body = RateLimitExceededResponse {
        error: ErrorResponse {
            code: 10006,
            message: "Too many requests, please slow down".to_string(),
            retry_after: Some(retry_after),
        },
        rate_limit: RateLimitInfo {
            retry_after,
            ..info
        },
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();

    if let Ok(v) = header::HeaderValue::from_str(&retry_after.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, v);
    }
    add_rate_limit_headers(response.headers_mut(), &info);

    response
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with_headers(headers: &[(&str, &str)]) -> Request {
        let mut builder = axum::http::Request::builder().uri("/health");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_authenticated_user_is_preferred() {
        let mut request = request_with_headers(&[("x-forwarded-for", "10.0.0.1")]);
        request.extensions_mut().insert(AuthUser {
            user_id: "admin-1".into(),
            name: "Admin".into(),
            roles: vec!["admin".into()],
        });

        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(extract_identifier(&request, Some(ip), true), "user:admin-1");
    }

    #[test]
    fn test_forwarded_headers_ignored_unless_trusted() {
        let request = request_with_headers(&[("x-forwarded-for", "10.0.0.1, 10.0.0.2")]);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        assert_eq!(extract_identifier(&request, Some(ip), false), "ip:127.0.0.1");
        assert_eq!(extract_identifier(&request, Some(ip), true), "ip:10.0.0.1");
    }

    #[test]
    fn test_client_ip_from_connect_info() {
        let mut request = request_with_headers(&[]);
        assert_eq!(client_ip(&request), None);

        let peer: SocketAddr = "192.0.2.7:51234".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));
        assert_eq!(client_ip(&request), Some(peer.ip()));
        assert_eq!(
            extract_identifier(&request, client_ip(&request), false),
            "ip:192.0.2.7"
        );
    }

    #[test]
    fn test_unknown_client() {
        let request = request_with_headers(&[]);
        assert_eq!(extract_identifier(&request, None, false), "ip:unknown");
    }

    #[test]
    fn test_rate_limit_response_has_retry_after() {
        let response = create_rate_limit_response(RateLimitInfo {
            limit: 20,
            remaining: 0,
            retry_after: 0,
        });

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");
        assert_eq!(response.headers().get("X-RateLimit-Limit").unwrap(), "20");
    }
}
