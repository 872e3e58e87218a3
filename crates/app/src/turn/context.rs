//! The per-session conversation context.
//!
//! An append-only log of user/assistant pairs under a pinned system
//! message. The controller is the only writer; everything else sees
//! snapshots.

#[cfg(not(test))]
use voxloop_frames::ChatMessage;
#[cfg(test)]
use voxloop_frames::{ChatMessage, Role};

pub struct ContextStore {
    system: ChatMessage,
    /// Strictly alternating user/assistant messages, oldest first.
    history: Vec<ChatMessage>,
    /// Retained turns (user+assistant pairs).
    max_turns: usize,
}

impl ContextStore {
    pub fn new(system_prompt: impl Into<String>, max_turns: usize) -> Self {
        Self {
            system: ChatMessage::system(system_prompt),
            history: Vec::new(),
            max_turns: max_turns.max(1),
        }
    }

    /// Atomically append a completed turn.
    ///
    /// An empty assistant reply makes the whole commit a no-op: the user
    /// message is withheld as well, keeping strict alternation and leaving
    /// the eviction budget untouched.
    pub fn commit_turn(&mut self, user_text: &str, assistant_text: &str) {
        if assistant_text.is_empty() {
            return;
        }
        self.history.push(ChatMessage::user(user_text));
        self.history.push(ChatMessage::assistant(assistant_text));
        while self.history.len() > self.max_turns * 2 {
            // Oldest pair goes together.
            self.history.drain(..2);
        }
    }

    /// Read-only copy for prompt assembly: system message first.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 1);
        messages.push(self.system.clone());
        messages.extend(self.history.iter().cloned());
        messages
    }

    /// Session end. The system message survives.
    pub fn reset(&mut self) {
        self.history.clear();
    }

    pub fn non_system_len(&self) -> usize {
        self.history.len()
    }

    pub fn system_prompt(&self) -> &str {
        &self.system.text
    }
}
