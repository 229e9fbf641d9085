//! # Domain Layer
//!
//! Conversation entities and the contracts of the external collaborators
//! (storage, LLM, notifications). Independent of transport and framework.
//!
//! ## Structure
//!
//! - **entities**: sessions and stored messages, plus the storage trait
//! - **services**: LLM provider and notifier traits

pub mod entities;
pub mod services;

// Re-export commonly used types
pub use entities::*;
pub use services::*;
