//! Speech-to-text capability contract.
//!
//! Concrete recognizers (Whisper-family models, cloud APIs) plug in behind
//! [`SpeechToText`]; the engine only depends on the trait. The crate ships a
//! deterministic scripted recognizer for tests and development.

pub mod engine;
pub mod scripted;
pub mod types;

pub use engine::{SpeechToText, SttError, UtteranceAudio};
pub use scripted::ScriptedStt;
pub use types::TranscriptEvent;
