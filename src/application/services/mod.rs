//! Application Services
//!
//! Stateful services shared by every connection.
//!
//! ## Available Services
//!
//! - **SlidingWindowLimiter**: keyed sliding-window admission control
//! - **SessionRegistry**: in-memory sessions with reconnection and expiry

pub mod rate_limiter;
pub mod session_registry;

pub use rate_limiter::{RateLimitConfig, RateLimitInfo, RateLimiters, SlidingWindowLimiter};
pub use session_registry::{
    RegistryConfig, RegistryStats, ResolvedSession, SessionError, SessionRegistry,
};
