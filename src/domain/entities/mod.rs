//! # Domain Entities
//!
//! - **ChatSession**: one conversation with its history, flags and metrics
//! - **StoredMessage**: one message of a conversation
//!
//! The storage trait lives beside the session entity and is implemented in
//! the infrastructure layer.

mod message;
mod session;

pub use message::{Sender, StoredMessage};
pub use session::{
    generate_session_name, sort_newest_first, ChatSession, SessionStore, SessionSummary,
    StoreError, DEFAULT_SESSION_NAME, MAX_RESPONSE_TIME_SAMPLES, MAX_SESSION_NAME_LENGTH,
};

#[cfg(test)]
pub use session::MockSessionStore;
