//! # Infrastructure Layer
//!
//! Implementations of the domain collaborator traits, plus metrics.
//!
//! - **storage**: in-memory `SessionStore`
//! - **llm**: built-in echo `LlmProvider`
//! - **notification**: log-only `Notifier`
//! - **metrics**: Prometheus registry and helpers

pub mod llm;
pub mod metrics;
pub mod notification;
pub mod storage;

pub use llm::EchoLlmProvider;
pub use notification::LogNotifier;
pub use storage::InMemorySessionStore;
