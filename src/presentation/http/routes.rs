//! Route Configuration
//!
//! Configures all HTTP routes for the API.

use axum::{
    extract::State,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::infrastructure::metrics;
use crate::presentation::middleware::{
    auth_middleware, create_cors_layer, rate_limit_admin, rate_limit_public, require_admin,
    track_http_metrics, SecurityHeadersConfig, SecurityHeadersLayer,
};
use crate::presentation::websocket::ws_handler;
use crate::startup::AppState;

/// Create the main router, mounted under `server.path_prefix` when one is
/// configured.
pub fn create_router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/ws", get(ws_handler))
        .merge(session_routes(state.clone()))
        .nest("/admin", admin_routes(state.clone()))
        .merge(public_routes(state.clone()));

    let prefix = state.settings.server.path_prefix.trim_end_matches('/');
    let routes = if prefix.is_empty() {
        routes
    } else {
        Router::new().nest(prefix, routes)
    };

    routes
        .layer(middleware::from_fn(track_http_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(create_cors_layer(&state.settings.cors))
        // Outermost so every response carries the headers
        .layer(SecurityHeadersLayer::new(SecurityHeadersConfig::for_environment(
            &state.settings.environment,
        )))
        .with_state(state)
}

/// Prometheus metrics endpoint handler
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.sessions.stats();
    metrics::set_sessions(stats.active, stats.inactive);
    let metrics = metrics::gather_metrics();
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        metrics,
    )
}

/// Health and metrics, keyed by client address
fn public_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/live", get(handlers::health::liveness))
        .route("/health/ready", get(handlers::health::readiness))
        .route("/metrics", get(metrics_handler))
        .route_layer(middleware::from_fn_with_state(state, rate_limit_public))
}

/// The caller's own history (protected)
fn session_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/sessions", get(handlers::sessions::list_my_sessions))
        .route_layer(middleware::from_fn_with_state(state, auth_middleware))
}

/// Admin routes (admin role, admin rate limit)
fn admin_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/sessions", get(handlers::admin::list_sessions))
        .route("/stats", get(handlers::admin::stats))
        .route("/takeover/{session_id}", post(handlers::admin::takeover))
        .route("/sessions/{session_id}/leave", post(handlers::admin::leave))
        // Last added runs first: authenticate, check the role, then count
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit_admin))
        .route_layer(middleware::from_fn(require_admin))
        .route_layer(middleware::from_fn_with_state(state, auth_middleware))
}
