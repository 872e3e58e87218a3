//! Typed frames, the currency of the voxloop pipeline.
//!
//! Every stage consumes and produces [`Frame`] values over its queues and
//! pattern-matches on the variant tag. The union is closed: there is no
//! open subclassing, extension happens by adding variants here.

pub mod frame;
pub mod message;
pub mod pcm;
pub mod seq;

pub use frame::{Frame, FrameMeta, Interrupt, InterruptReason, SystemKind};
pub use message::{ChatMessage, Role};
pub use seq::FrameSequencer;
