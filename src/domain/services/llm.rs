//! LLM provider contract.
//!
//! Providers stream the assistant reply chunk by chunk. Every call carries a
//! deadline and a cancellation token; a provider must stop producing chunks
//! and release upstream resources once the token fires.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::entities::StoredMessage;

/// Stream of reply fragments.
pub type ChunkStream = BoxStream<'static, Result<String, LlmError>>;

/// One model turn.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub session_id: String,
    pub model_id: String,
    /// Conversation so far, oldest first, including the new user message
    pub conversation: Vec<StoredMessage>,
    /// The provider should give up by this instant
    pub deadline: Instant,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider rejected the request: {0}")]
    Rejected(String),

    #[error("deadline exceeded")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Start streaming a reply.
    async fn stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, LlmError>;
}

/// Rough token estimate used for session accounting.
pub fn estimate_tokens(text: &str) -> u64 {
    ((text.chars().count() / 4) as u64).max(1)
}
