use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared counters for cross-task pipeline monitoring.
///
/// All fields are monotonic event counters; cheap to bump from any stage.
#[derive(Clone, Default)]
pub struct PipelineMetrics {
    pub audio_in_frames: Arc<AtomicU64>,
    pub audio_in_dropped: Arc<AtomicU64>,
    pub audio_out_frames: Arc<AtomicU64>,
    pub speech_segments: Arc<AtomicU64>,

    pub turns_started: Arc<AtomicU64>,
    pub turns_completed: Arc<AtomicU64>,
    pub turns_interrupted: Arc<AtomicU64>,
    pub turns_aborted: Arc<AtomicU64>,

    pub utterances_synthesized: Arc<AtomicU64>,
    pub tts_restarts: Arc<AtomicU64>,

    pub stt_errors: Arc<AtomicU64>,
    pub llm_errors: Arc<AtomicU64>,
    pub tts_errors: Arc<AtomicU64>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(counter: &Arc<AtomicU64>) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &Arc<AtomicU64>, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &Arc<AtomicU64>) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_shared_across_clones() {
        let m = PipelineMetrics::new();
        let m2 = m.clone();
        PipelineMetrics::bump(&m.turns_started);
        PipelineMetrics::bump(&m2.turns_started);
        assert_eq!(PipelineMetrics::get(&m.turns_started), 2);
    }
}
