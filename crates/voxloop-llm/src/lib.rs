//! Streaming language-model capability contract.
//!
//! Chat models plug in behind [`LanguageModel`], which hands back a bounded
//! token stream. A deterministic scripted provider ships for tests and
//! development.

pub mod provider;
pub mod scripted;

pub use provider::{GenerationParams, LanguageModel, LlmError, TokenChunk, TokenStream};
pub use scripted::ScriptedLlm;
