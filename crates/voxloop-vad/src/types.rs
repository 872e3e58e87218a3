#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VadEvent {
    SpeechStart {
        /// Stream position at onset, in milliseconds of processed audio.
        timestamp_ms: u64,
    },
    SpeechEnd {
        timestamp_ms: u64,
        duration_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VadState {
    #[default]
    Silence,
    Speech,
}
