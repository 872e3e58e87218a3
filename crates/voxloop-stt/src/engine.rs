use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::TranscriptEvent;

#[derive(Debug, Error)]
pub enum SttError {
    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("transcription failed: {0}")]
    Transcription(String),

    #[error("recognizer does not support {0} Hz input")]
    SampleRate(u32),
}

/// A complete, segmented utterance ready for recognition.
#[derive(Debug, Clone, Copy)]
pub struct UtteranceAudio<'a> {
    pub samples: &'a [i16],
    pub sample_rate: u32,
}

impl UtteranceAudio<'_> {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }
}

/// Speech-to-text capability provider.
///
/// Decoding runs at temperature 0, so transcription is deterministic for a
/// given utterance. Implementations emit zero or more `Partial` events
/// followed by exactly one `Final` on success; a silence-only utterance
/// yields a `Final` with empty text. Cancellation is cooperative: the stage
/// drops the event receiver and abandons the future.
#[async_trait]
pub trait SpeechToText: Send {
    fn name(&self) -> &str;

    /// Prepare the recognizer (load the model). Called once per session.
    async fn load(&mut self) -> Result<(), SttError>;

    async fn transcribe(
        &mut self,
        audio: UtteranceAudio<'_>,
        events: &mpsc::Sender<TranscriptEvent>,
    ) -> Result<(), SttError>;
}

#[async_trait]
impl<T: SpeechToText + ?Sized> SpeechToText for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn load(&mut self) -> Result<(), SttError> {
        (**self).load().await
    }

    async fn transcribe(
        &mut self,
        audio: UtteranceAudio<'_>,
        events: &mpsc::Sender<TranscriptEvent>,
    ) -> Result<(), SttError> {
        (**self).transcribe(audio, events).await
    }
}
