//! HTTP Layer
//!
//! Routes and handlers for the admin API, session history, health probes
//! and metrics. The WebSocket upgrade route is mounted here as well.

pub mod handlers;
pub mod routes;

pub use routes::create_router;
