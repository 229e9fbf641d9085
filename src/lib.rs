//! # Chatbox Server Library
//!
//! This crate provides the core of a real-time chat backend:
//! - WebSocket gateway with per-connection outbound queues and fan-out to
//!   every device of a user
//! - In-memory session registry with reconnection grace and expiry
//! - Message router streaming model replies and relaying admin takeovers
//! - Sliding-window rate limiting for messages, admin actions and public
//!   endpoints
//!
//! ## Architecture
//!
//! - **Domain Layer**: Session entities and collaborator traits
//! - **Application Layer**: Rate limiter and session registry
//! - **Infrastructure Layer**: Metrics and built-in collaborators
//! - **Presentation Layer**: HTTP handlers, middleware and WebSocket gateway
//!
//! ## Module Structure
//!
//! ```text
//! chatbox_server/
//! +-- config/         Configuration management
//! +-- domain/         Entities and collaborator traits
//! +-- application/    Rate limiter and session registry
//! +-- infrastructure/ Storage, LLM, notifications, metrics
//! +-- presentation/   HTTP routes, middleware, WebSocket gateway
//! +-- shared/         Errors and background tasks
//! ```

// Configuration module
pub mod config;

// Domain layer - Core business logic
pub mod domain;

// Application layer - Business services
pub mod application;

// Infrastructure layer - External implementations
pub mod infrastructure;

// Presentation layer - HTTP and WebSocket handlers
pub mod presentation;

// Shared utilities
pub mod shared;

// Application startup and state management
pub mod startup;

// Telemetry and observability
pub mod telemetry;
