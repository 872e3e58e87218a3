//! Turn management: the conversation state machine, the context store it
//! owns, and the sentence aggregator feeding synthesis.

pub mod aggregator;
pub mod context;
pub mod controller;
pub mod types;

pub use aggregator::SentenceAggregator;
pub use context::ContextStore;
pub use controller::{ControllerOutcome, TurnController};
pub use types::{ControllerStatus, SpeakEvent, Turn, TurnState};
