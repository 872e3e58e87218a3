//! Deterministic chat provider for tests and development.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use voxloop_frames::{ChatMessage, Role};

use crate::provider::{GenerationParams, LanguageModel, LlmError, TokenChunk, TokenStream};

/// Token-stream channel depth handed to consumers.
const STREAM_DEPTH: usize = 64;

/// Provider that picks a reply by substring-matching the latest user
/// message against its rule table, streaming it in small deltas.
///
/// Rules are checked in insertion order; the first match wins, otherwise
/// `default_reply` is streamed. An optional per-delta delay simulates
/// generation pace for timeout and cancellation tests.
pub struct ScriptedLlm {
    rules: Vec<(String, String)>,
    default_reply: String,
    delta_chars: usize,
    delta_delay: Duration,
    fail_next: AtomicBool,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            default_reply: "I see.".to_string(),
            delta_chars: 8,
            delta_delay: Duration::ZERO,
            fail_next: AtomicBool::new(false),
        }
    }

    /// Reply with `reply` when the latest user message contains `pattern`
    /// (case-insensitive).
    pub fn with_rule(mut self, pattern: impl Into<String>, reply: impl Into<String>) -> Self {
        self.rules
            .push((pattern.into().to_lowercase(), reply.into()));
        self
    }

    pub fn with_default_reply(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = reply.into();
        self
    }

    pub fn with_delta_chars(mut self, n: usize) -> Self {
        self.delta_chars = n.max(1);
        self
    }

    pub fn with_delta_delay(mut self, delay: Duration) -> Self {
        self.delta_delay = delay;
        self
    }

    /// Make the next `chat_stream` call fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::Relaxed);
    }

    fn pick_reply(&self, messages: &[ChatMessage]) -> String {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text.to_lowercase())
            .unwrap_or_default();
        self.rules
            .iter()
            .find(|(pattern, _)| last_user.contains(pattern))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| self.default_reply.clone())
    }
}

impl Default for ScriptedLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        _params: GenerationParams,
    ) -> Result<TokenStream, LlmError> {
        if self.fail_next.swap(false, Ordering::Relaxed) {
            return Err(LlmError::Generation("scripted failure".to_string()));
        }

        let reply = self.pick_reply(messages);
        debug!(target: "llm", reply_len = reply.len(), "scripted generation");

        let (tx, rx) = mpsc::channel(STREAM_DEPTH);
        let delta_chars = self.delta_chars;
        let delta_delay = self.delta_delay;
        tokio::spawn(async move {
            let chars: Vec<char> = reply.chars().collect();
            for piece in chars.chunks(delta_chars) {
                if !delta_delay.is_zero() {
                    tokio::time::sleep(delta_delay).await;
                }
                let delta: String = piece.iter().collect();
                if tx.send(TokenChunk::Delta(delta)).await.is_err() {
                    // Consumer dropped the stream: cancelled.
                    return;
                }
            }
            let _ = tx.send(TokenChunk::Done(reply)).await;
        });

        Ok(TokenStream { rx })
    }
}
