//! Streaming voice-activity detection.
//!
//! The engine classifies fixed-size analysis windows (~32 ms) as speech or
//! silence against an adaptive noise floor, then a hysteresis state machine
//! turns the raw classifications into speech-start / speech-end events.

pub mod chunker;
pub mod config;
pub mod energy;
pub mod engine;
pub mod floor;
pub mod state;
pub mod types;

pub use chunker::WindowChunker;
pub use config::VadConfig;
pub use engine::{EnergyVad, VadEngine, VadError};
pub use types::{VadEvent, VadState};
