use serde::{Deserialize, Serialize};

/// Analysis window length. 512 samples at 16 kHz is 32 ms.
pub const WINDOW_SIZE_SAMPLES: usize = 512;
pub const SAMPLE_RATE_HZ: u32 = 16_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// Continuous activity required before SpeechStart fires.
    pub start_threshold_ms: u32,

    /// Continuous silence required before SpeechEnd fires.
    pub min_silence_ms: u32,

    /// Audio kept from before onset and prepended to the utterance.
    pub speech_pad_ms: u32,

    /// dB above the noise floor to classify a window as speech.
    pub onset_db: f32,

    /// dB above the noise floor below which a window counts as silence.
    /// Lower than `onset_db` so classification itself has hysteresis.
    pub offset_db: f32,

    /// EMA coefficient for noise-floor tracking during silence.
    pub floor_alpha: f32,

    pub initial_floor_db: f32,

    /// Hard cap on a single speech segment; a synthetic SpeechEnd is
    /// emitted when exceeded.
    pub max_speech_ms: Option<u32>,

    pub window_size_samples: usize,
    pub sample_rate_hz: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            start_threshold_ms: 80,
            min_silence_ms: 200,
            speech_pad_ms: 120,
            onset_db: 9.0,
            offset_db: 6.0,
            floor_alpha: 0.02,
            initial_floor_db: -50.0,
            max_speech_ms: Some(30_000),
            window_size_samples: WINDOW_SIZE_SAMPLES,
            sample_rate_hz: SAMPLE_RATE_HZ,
        }
    }
}

impl VadConfig {
    pub fn window_duration_ms(&self) -> f32 {
        (self.window_size_samples as f32 * 1000.0) / self.sample_rate_hz as f32
    }

    /// Windows of continuous activity before SpeechStart.
    pub fn start_windows(&self) -> u32 {
        (self.start_threshold_ms as f32 / self.window_duration_ms()).ceil().max(1.0) as u32
    }

    /// Windows of continuous silence before SpeechEnd.
    pub fn silence_windows(&self) -> u32 {
        (self.min_silence_ms as f32 / self.window_duration_ms()).ceil().max(1.0) as u32
    }

    /// Sample count of the pre-speech padding buffer.
    pub fn pad_samples(&self) -> usize {
        (self.speech_pad_ms as usize * self.sample_rate_hz as usize) / 1000
    }

    pub fn max_speech_windows(&self) -> Option<u32> {
        self.max_speech_ms
            .map(|ms| (ms as f32 / self.window_duration_ms()).ceil() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_windows_at_16k() {
        let cfg = VadConfig::default();
        assert_eq!(cfg.window_duration_ms(), 32.0);
        // 80 ms onset -> 3 windows, 200 ms hold-off -> 7 windows
        assert_eq!(cfg.start_windows(), 3);
        assert_eq!(cfg.silence_windows(), 7);
        // 120 ms of padding at 16 kHz
        assert_eq!(cfg.pad_samples(), 1920);
    }
}
