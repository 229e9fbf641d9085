//! Middleware
//!
//! Tower middleware for request processing.

pub mod auth;
pub mod cors;
pub mod metrics;
pub mod rate_limit;
pub mod security;

pub use auth::{auth_middleware, require_admin, AuthUser, JwtVerifier};
pub use cors::{create_cors_layer, is_origin_allowed};
pub use metrics::track_http_metrics;
pub use rate_limit::{rate_limit_admin, rate_limit_public};
pub use security::{SecurityHeadersConfig, SecurityHeadersLayer};
