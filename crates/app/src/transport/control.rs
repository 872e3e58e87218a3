//! JSON payloads for the control and system planes.

use serde::{Deserialize, Serialize};

use voxloop_foundation::ErrorKind;

/// Control-plane and system-plane messages.
///
/// `hello`/`accept`/`drain` travel as system frames (0xFF); the rest as
/// control frames (0x10).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlMessage {
    Hello {
        sr_in: u32,
        sr_out: u32,
        codec: String,
    },
    Accept {
        sr_in: u32,
        sr_out: u32,
    },
    Drain,
    Interrupt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    TtsStarted {
        turn_id: u64,
    },
    TtsStopped {
        turn_id: u64,
    },
}

/// Error-plane payload (0x20). Exactly one per failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub kind: ErrorKind,
    pub message: String,
    pub recoverable: bool,
}
