//! Client transport: a single persistent duplex channel carrying
//! length-delimited binary messages, with a JSON control plane multiplexed
//! alongside the audio.

pub mod codec;
pub mod control;
pub mod session;

pub use codec::{WireFrame, WireKind, MAX_PAYLOAD_BYTES};
pub use control::{ControlMessage, ErrorMessage};
pub use session::{SessionIo, SessionParams};
