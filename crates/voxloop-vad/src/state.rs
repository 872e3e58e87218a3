use crate::config::VadConfig;
use crate::types::{VadEvent, VadState};

/// Hysteresis state machine over per-window speech classifications.
///
/// Time is derived from the window count, so the machine is fully
/// deterministic for a given input sequence.
pub struct VadStateMachine {
    state: VadState,
    active_run: u32,
    silent_run: u32,
    windows_in_speech: u32,
    windows_total: u64,
    speech_started_at_ms: u64,
    start_windows: u32,
    silence_windows: u32,
    max_speech_windows: Option<u32>,
    window_ms: f32,
}

impl VadStateMachine {
    pub fn new(config: &VadConfig) -> Self {
        Self {
            state: VadState::Silence,
            active_run: 0,
            silent_run: 0,
            windows_in_speech: 0,
            windows_total: 0,
            speech_started_at_ms: 0,
            start_windows: config.start_windows(),
            silence_windows: config.silence_windows(),
            max_speech_windows: config.max_speech_windows(),
            window_ms: config.window_duration_ms(),
        }
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    fn position_ms(&self) -> u64 {
        (self.windows_total as f64 * self.window_ms as f64) as u64
    }

    /// Advance one window. `active` is the classifier's verdict for it.
    pub fn advance(&mut self, active: bool) -> Option<VadEvent> {
        self.windows_total += 1;

        match self.state {
            VadState::Silence => {
                if active {
                    self.active_run += 1;
                    if self.active_run >= self.start_windows {
                        self.state = VadState::Speech;
                        self.active_run = 0;
                        self.silent_run = 0;
                        self.windows_in_speech = 0;
                        self.speech_started_at_ms = self.position_ms();
                        return Some(VadEvent::SpeechStart {
                            timestamp_ms: self.speech_started_at_ms,
                        });
                    }
                } else {
                    self.active_run = 0;
                }
                None
            }
            VadState::Speech => {
                self.windows_in_speech += 1;

                if let Some(max) = self.max_speech_windows {
                    if self.windows_in_speech >= max {
                        return Some(self.end_speech());
                    }
                }

                if active {
                    self.silent_run = 0;
                    None
                } else {
                    self.silent_run += 1;
                    if self.silent_run >= self.silence_windows {
                        Some(self.end_speech())
                    } else {
                        None
                    }
                }
            }
        }
    }

    fn end_speech(&mut self) -> VadEvent {
        self.state = VadState::Silence;
        self.active_run = 0;
        self.silent_run = 0;
        let now = self.position_ms();
        let duration = now.saturating_sub(self.speech_started_at_ms).max(1);
        VadEvent::SpeechEnd {
            timestamp_ms: now,
            duration_ms: duration,
        }
    }

    pub fn reset(&mut self) {
        self.state = VadState::Silence;
        self.active_run = 0;
        self.silent_run = 0;
        self.windows_in_speech = 0;
        self.windows_total = 0;
        self.speech_started_at_ms = 0;
    }
}
