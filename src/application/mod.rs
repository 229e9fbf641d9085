//! Application Layer
//!
//! Services that own the shared mutable state of the chat core: rate-limit
//! buckets and the session map. Each is constructed explicitly, started
//! with its background task and stopped once at shutdown.

pub mod services;
