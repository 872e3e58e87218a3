use std::time::Duration;

use tracing::info;

/// Per-turn latency measurements, all relative to turn creation.
///
/// A `None` field means the turn never reached that point (interrupted or
/// aborted early).
#[derive(Debug, Clone, Default)]
pub struct TurnReport {
    pub turn_id: u64,
    pub t_vad_end: Option<Duration>,
    pub t_stt_done: Option<Duration>,
    pub t_llm_first_token: Option<Duration>,
    pub t_tts_first_audio: Option<Duration>,
    pub t_tts_done: Option<Duration>,
    pub interrupted: bool,
}

impl TurnReport {
    /// End-of-speech to first bot audio, the headline latency number.
    pub fn response_latency(&self) -> Option<Duration> {
        match (self.t_vad_end, self.t_tts_first_audio) {
            (Some(end), Some(audio)) => audio.checked_sub(end),
            _ => None,
        }
    }
}

/// Destination for per-turn reports. Implementations must not block.
pub trait MetricsSink: Send + Sync {
    fn record_turn(&self, report: &TurnReport);
}

/// Default sink: one structured log event per turn.
pub struct LogSink;

impl MetricsSink for LogSink {
    fn record_turn(&self, report: &TurnReport) {
        info!(
            target: "telemetry",
            turn_id = report.turn_id,
            vad_end_ms = report.t_vad_end.map(|d| d.as_millis() as u64),
            stt_done_ms = report.t_stt_done.map(|d| d.as_millis() as u64),
            llm_first_token_ms = report.t_llm_first_token.map(|d| d.as_millis() as u64),
            tts_first_audio_ms = report.t_tts_first_audio.map(|d| d.as_millis() as u64),
            tts_done_ms = report.t_tts_done.map(|d| d.as_millis() as u64),
            response_latency_ms = report.response_latency().map(|d| d.as_millis() as u64),
            interrupted = report.interrupted,
            "turn retired"
        );
    }
}

/// Sink that discards everything; used in tests.
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record_turn(&self, _report: &TurnReport) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_latency_is_relative_to_speech_end() {
        let report = TurnReport {
            turn_id: 1,
            t_vad_end: Some(Duration::from_millis(1500)),
            t_tts_first_audio: Some(Duration::from_millis(2100)),
            ..Default::default()
        };
        assert_eq!(report.response_latency(), Some(Duration::from_millis(600)));
    }

    #[test]
    fn missing_measurements_give_no_latency() {
        let report = TurnReport {
            turn_id: 2,
            t_vad_end: Some(Duration::from_millis(900)),
            ..Default::default()
        };
        assert_eq!(report.response_latency(), None);
    }
}
