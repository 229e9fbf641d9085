//! # Domain Services
//!
//! Contracts for the collaborators the chat core calls out to. These traits
//! are implemented in the infrastructure layer.
//!
//! - **LlmProvider**: streaming model replies with deadline and cancellation
//! - **Notifier**: fire-and-forget alerts for help requests and takeovers

mod llm;
mod notification;

pub use llm::*;
pub use notification::*;
