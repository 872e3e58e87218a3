//! voxloop: a real-time voice-conversation orchestration engine.
//!
//! One session per client connection. Inside a session, typed frames move
//! through a pipeline of concurrent stage workers: transport in, VAD gate,
//! STT, turn controller, LLM, sentence aggregator, TTS parent, transport
//! out. Interruption travels backwards on a broadcast side channel.

pub mod runtime;
pub mod stages;
pub mod transport;
pub mod turn;
