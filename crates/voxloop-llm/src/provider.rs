use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use voxloop_frames::ChatMessage;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("generation failed: {0}")]
    Generation(String),
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 512,
        }
    }
}

/// A chunk from a streaming generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenChunk {
    /// Incremental text from the model.
    Delta(String),
    /// Stream complete. Carries the fully assembled reply for convenience.
    Done(String),
}

/// Handle to a streaming generation.
///
/// The channel is bounded; a slow consumer backpressures the producer.
/// Dropping the handle cancels generation within one step: the producer's
/// next send fails and it stops.
pub struct TokenStream {
    pub rx: mpsc::Receiver<TokenChunk>,
}

impl TokenStream {
    pub async fn next(&mut self) -> Option<TokenChunk> {
        self.rx.recv().await
    }
}

/// Streaming chat-model capability provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    /// Start streaming a reply to `messages` (system message first, then
    /// alternating user/assistant history, ending with the current user
    /// turn).
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        params: GenerationParams,
    ) -> Result<TokenStream, LlmError>;
}
