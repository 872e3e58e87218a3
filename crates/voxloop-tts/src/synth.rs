use thiserror::Error;

#[derive(Debug, Error)]
pub enum SynthError {
    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("synthesis failed: {0}")]
    Synthesis(String),
}

#[derive(Debug, Clone)]
pub struct SynthesisOptions {
    pub voice_id: Option<String>,
    pub language: Option<String>,
    pub speed: f32,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            voice_id: None,
            language: None,
            speed: 1.0,
        }
    }
}

/// The synthesis capability loaded inside the worker process.
///
/// One model, loaded once at startup, producing PCM16LE mono at a fixed
/// declared sample rate for the whole session. Implementations may block;
/// the worker handles one request at a time by design.
pub trait Synthesizer: Send {
    fn name(&self) -> &str;

    fn load(&mut self) -> Result<(), SynthError>;

    fn sample_rate(&self) -> u32;

    fn synthesize(&mut self, text: &str, options: &SynthesisOptions) -> Result<Vec<u8>, SynthError>;
}

/// Deterministic development synthesizer.
///
/// Maps each character to a short sine burst whose frequency is derived
/// from the character code. Nothing about it sounds like speech, but its
/// output length is proportional to the text, it is byte-for-byte
/// reproducible, and it exercises the full chunked-audio path.
pub struct TonePcmSynthesizer {
    sample_rate: u32,
    ms_per_char: u32,
}

impl TonePcmSynthesizer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            ms_per_char: 25,
        }
    }
}

impl Synthesizer for TonePcmSynthesizer {
    fn name(&self) -> &str {
        "tone"
    }

    fn load(&mut self) -> Result<(), SynthError> {
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn synthesize(&mut self, text: &str, options: &SynthesisOptions) -> Result<Vec<u8>, SynthError> {
        let speed = if options.speed > 0.0 { options.speed } else { 1.0 };
        let samples_per_char =
            ((self.ms_per_char as f32 / speed) * self.sample_rate as f32 / 1000.0) as usize;

        let mut pcm = Vec::with_capacity(text.len() * samples_per_char * 2);
        for ch in text.chars() {
            let freq = 220.0 + (ch as u32 % 64) as f32 * 10.0;
            for i in 0..samples_per_char {
                let phase = 2.0 * std::f32::consts::PI * freq * i as f32 / self.sample_rate as f32;
                let sample = (phase.sin() * 8_000.0) as i16;
                pcm.extend_from_slice(&sample.to_le_bytes());
            }
        }
        Ok(pcm)
    }
}
