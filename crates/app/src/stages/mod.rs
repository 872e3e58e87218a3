//! Pipeline stage workers. Each owns its input queue and mutable state,
//! communicates only through channels, and checks cancellation before
//! blocking and before emitting.

pub mod llm_stage;
pub mod stt_stage;
pub mod tts_stage;
pub mod vad_gate;

pub use llm_stage::LlmStage;
pub use stt_stage::SttStage;
pub use tts_stage::TtsStage;
pub use vad_gate::VadGate;
