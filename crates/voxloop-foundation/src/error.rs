use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error category tokens surfaced to the client in error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Protocol,
    Config,
    ModelLoad,
    Stt,
    Llm,
    Tts,
    Timeout,
    ChildExit,
    Backpressure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Protocol => "protocol",
            ErrorKind::Config => "config",
            ErrorKind::ModelLoad => "model_load",
            ErrorKind::Stt => "stt",
            ErrorKind::Llm => "llm",
            ErrorKind::Tts => "tts",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ChildExit => "child_exit",
            ErrorKind::Backpressure => "backpressure",
        }
    }
}

/// Pipeline stage names used in timeout errors and logging targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Transport,
    Vad,
    Stt,
    Llm,
    Tts,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Transport => "transport",
            Stage::Vad => "vad",
            Stage::Stt => "stt",
            Stage::Llm => "llm",
            Stage::Tts => "tts",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for the engine.
///
/// Every variant maps onto one [`ErrorKind`] token and a recoverability
/// classification. Recoverable errors abort the current turn and leave the
/// session open; unrecoverable errors tear the session (or the process) down.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("transport bind failed: {0}")]
    Bind(#[source] std::io::Error),

    #[error("speech recognition failed: {0}")]
    Stt(String),

    #[error("language model failed: {0}")]
    Llm(String),

    #[error("speech synthesis failed: {0}")]
    Tts(String),

    #[error("{stage} stage exceeded its {limit:?} deadline")]
    Timeout { stage: Stage, limit: Duration },

    #[error("synthesis worker exited: {0}")]
    ChildExit(String),

    #[error("downstream queue saturated: {0}")]
    Backpressure(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Protocol(_) | EngineError::Io(_) | EngineError::Bind(_) => {
                ErrorKind::Protocol
            }
            EngineError::Config(_) => ErrorKind::Config,
            EngineError::ModelLoad(_) => ErrorKind::ModelLoad,
            EngineError::Stt(_) => ErrorKind::Stt,
            EngineError::Llm(_) => ErrorKind::Llm,
            EngineError::Tts(_) => ErrorKind::Tts,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::ChildExit(_) => ErrorKind::ChildExit,
            EngineError::Backpressure(_) => ErrorKind::Backpressure,
        }
    }

    /// Whether the session survives this error.
    ///
    /// Timeouts are attributed to the stage that missed its deadline and are
    /// recoverable like any other per-turn inference failure.
    pub fn recoverable(&self) -> bool {
        match self {
            EngineError::Stt(_)
            | EngineError::Llm(_)
            | EngineError::Tts(_)
            | EngineError::Timeout { .. }
            | EngineError::Backpressure(_) => true,
            EngineError::ChildExit(_) => true,
            EngineError::Protocol(_)
            | EngineError::Config(_)
            | EngineError::ModelLoad(_)
            | EngineError::Bind(_)
            | EngineError::Io(_) => false,
        }
    }

    /// Process exit code for startup failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Config(_) => 1,
            EngineError::ModelLoad(_) => 2,
            EngineError::Bind(_) => 3,
            _ => 1,
        }
    }

    /// The [`ErrorKind`] a timeout collapses to when reported to the client:
    /// the owning stage's inference kind rather than the generic token.
    pub fn surface_kind(&self) -> ErrorKind {
        match self {
            EngineError::Timeout { stage, .. } => match stage {
                Stage::Stt => ErrorKind::Stt,
                Stage::Llm => ErrorKind::Llm,
                Stage::Tts => ErrorKind::Tts,
                _ => ErrorKind::Timeout,
            },
            _ => self.kind(),
        }
    }
}
