//! CORS Middleware Configuration
//!
//! The same allow-list also gates WebSocket upgrades, see
//! [`is_origin_allowed`].

use axum::http::{header, Method};
use tower_http::cors::{Any, CorsLayer};

use crate::config::CorsSettings;

/// Create CORS layer from settings
pub fn create_cors_layer(settings: &CorsSettings) -> CorsLayer {
    let origins: Vec<_> = settings
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
            .allow_credentials(true)
            .max_age(std::time::Duration::from_secs(3600))
    }
}

/// Whether a WebSocket upgrade from `origin` may proceed.
///
/// An empty allow-list admits everything. Requests without an Origin
/// header are non-browser clients and are admitted.
pub fn is_origin_allowed(settings: &CorsSettings, origin: Option<&str>) -> bool {
    if settings.allowed_origins.is_empty() {
        return true;
    }

    match origin {
        None => true,
        Some(origin) => settings
            .allowed_origins
            .iter()
            .any(|allowed| allowed.trim_end_matches('/') == origin.trim_end_matches('/')),
    }
}
