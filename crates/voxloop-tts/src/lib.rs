//! Out-of-process speech synthesis.
//!
//! The synthesis model loads inside a dedicated child process so its heavy
//! native dependencies never share an address space with the engine. Parent
//! and child speak newline-delimited JSON over the child's standard
//! input/output; standard error carries logs only.

pub mod protocol;
pub mod supervisor;
pub mod synth;
pub mod worker;

pub use protocol::{WorkerRequest, WorkerResponse, MAX_RAW_CHUNK_BYTES};
pub use supervisor::{SupervisorConfig, TtsSupervisor};
pub use synth::{SynthError, SynthesisOptions, Synthesizer, TonePcmSynthesizer};
pub use worker::{run_worker, WorkerDefaults};

use thiserror::Error;

/// Parent-side supervision and protocol errors.
#[derive(Debug, Error)]
pub enum TtsError {
    #[error("failed to spawn synthesis worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker protocol violation: {0}")]
    Protocol(String),

    #[error("synthesis worker exited")]
    ChildExit,

    #[error("worker reported: {0}")]
    Worker(String),

    #[error("worker restart budget exhausted")]
    RestartBudget,
}
