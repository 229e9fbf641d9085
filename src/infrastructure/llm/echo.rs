//! Built-in LLM provider that echoes the last user message back.
//!
//! Used when no upstream model is configured and in tests. It honors the
//! deadline and cancellation contract like a real provider would.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::domain::{ChunkStream, CompletionRequest, LlmError, LlmProvider, Sender};

#[derive(Debug, Clone, Default)]
pub struct EchoLlmProvider {
    /// Pause before each streamed word
    chunk_delay: Duration,
}

impl EchoLlmProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_delay(chunk_delay: Duration) -> Self {
        Self { chunk_delay }
    }

    fn reply_for(request: &CompletionRequest) -> String {
        let last_user = request
            .conversation
            .iter()
            .rev()
            .find(|m| m.sender == Sender::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        format!("[{}] You said: {}", request.model_id, last_user)
    }
}

#[async_trait]
impl LlmProvider for EchoLlmProvider {
    async fn stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }

        let reply = Self::reply_for(&request);
        let words: Vec<String> = reply
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        let delay = self.chunk_delay;
        let deadline = request.deadline;

        let stream = futures::stream::iter(words).then(move |word| {
            let cancel = cancel.clone();
            async move {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                        _ = tokio::time::sleep_until(deadline) => return Err(LlmError::Timeout),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if cancel.is_cancelled() {
                    return Err(LlmError::Cancelled);
                }
                Ok(word)
            }
        });

        Ok(stream.boxed())
    }
}
