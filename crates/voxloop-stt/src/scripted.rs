//! Deterministic recognizer for tests and development.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::{SpeechToText, SttError, UtteranceAudio};
use crate::types::TranscriptEvent;

/// One scripted outcome, consumed per `transcribe` call in order.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Emit these partials, then the final text.
    Transcript {
        partials: Vec<String>,
        text: String,
    },
    /// Fail the call.
    Fail(String),
}

/// Recognizer that replays a script, one outcome per utterance.
///
/// When the script runs out it falls back to `default_text`, or to an empty
/// final transcript when no default is set (the silence case). An optional
/// per-call delay simulates inference latency for timeout tests.
pub struct ScriptedStt {
    script: VecDeque<ScriptedOutcome>,
    default_text: Option<String>,
    delay: Duration,
    load_failure: Option<String>,
    calls: usize,
}

impl ScriptedStt {
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            default_text: None,
            delay: Duration::ZERO,
            load_failure: None,
            calls: 0,
        }
    }

    pub fn with_transcript(mut self, text: impl Into<String>) -> Self {
        self.script.push_back(ScriptedOutcome::Transcript {
            partials: Vec::new(),
            text: text.into(),
        });
        self
    }

    pub fn with_partials(
        mut self,
        partials: Vec<String>,
        text: impl Into<String>,
    ) -> Self {
        self.script.push_back(ScriptedOutcome::Transcript {
            partials,
            text: text.into(),
        });
        self
    }

    pub fn with_failure(mut self, message: impl Into<String>) -> Self {
        self.script.push_back(ScriptedOutcome::Fail(message.into()));
        self
    }

    pub fn with_default_text(mut self, text: impl Into<String>) -> Self {
        self.default_text = Some(text.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_load(mut self, message: impl Into<String>) -> Self {
        self.load_failure = Some(message.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl Default for ScriptedStt {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn load(&mut self) -> Result<(), SttError> {
        match &self.load_failure {
            Some(msg) => Err(SttError::ModelLoad(msg.clone())),
            None => Ok(()),
        }
    }

    async fn transcribe(
        &mut self,
        audio: UtteranceAudio<'_>,
        events: &mpsc::Sender<TranscriptEvent>,
    ) -> Result<(), SttError> {
        self.calls += 1;
        debug!(
            target: "stt",
            call = self.calls,
            duration_ms = audio.duration_ms(),
            "scripted transcription"
        );

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let outcome = self.script.pop_front().unwrap_or_else(|| {
            ScriptedOutcome::Transcript {
                partials: Vec::new(),
                text: self.default_text.clone().unwrap_or_default(),
            }
        });

        match outcome {
            ScriptedOutcome::Transcript { partials, text } => {
                for partial in partials {
                    let _ = events.send(TranscriptEvent::Partial { text: partial }).await;
                }
                let _ = events.send(TranscriptEvent::Final { text }).await;
                Ok(())
            }
            ScriptedOutcome::Fail(message) => Err(SttError::Transcription(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio() -> Vec<i16> {
        vec![0i16; 1600]
    }

    #[tokio::test]
    async fn script_is_consumed_in_order() {
        let mut stt = ScriptedStt::new()
            .with_transcript("first")
            .with_transcript("second");
        let (tx, mut rx) = mpsc::channel(8);
        let samples = audio();
        let utterance = UtteranceAudio {
            samples: &samples,
            sample_rate: 16_000,
        };

        stt.transcribe(utterance, &tx).await.unwrap();
        stt.transcribe(utterance, &tx).await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(TranscriptEvent::Final {
                text: "first".into()
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(TranscriptEvent::Final {
                text: "second".into()
            })
        );
    }

    #[tokio::test]
    async fn exhausted_script_yields_empty_final() {
        let mut stt = ScriptedStt::new();
        let (tx, mut rx) = mpsc::channel(8);
        let samples = audio();
        stt.transcribe(
            UtteranceAudio {
                samples: &samples,
                sample_rate: 16_000,
            },
            &tx,
        )
        .await
        .unwrap();
        assert_eq!(rx.recv().await, Some(TranscriptEvent::Final { text: String::new() }));
    }

    #[tokio::test]
    async fn partials_precede_final() {
        let mut stt =
            ScriptedStt::new().with_partials(vec!["he".into(), "hell".into()], "hello");
        let (tx, mut rx) = mpsc::channel(8);
        let samples = audio();
        stt.transcribe(
            UtteranceAudio {
                samples: &samples,
                sample_rate: 16_000,
            },
            &tx,
        )
        .await
        .unwrap();

        assert!(matches!(rx.recv().await, Some(TranscriptEvent::Partial { .. })));
        assert!(matches!(rx.recv().await, Some(TranscriptEvent::Partial { .. })));
        assert_eq!(rx.recv().await, Some(TranscriptEvent::Final { text: "hello".into() }));
    }

    #[tokio::test]
    async fn scripted_failure_surfaces() {
        let mut stt = ScriptedStt::new().with_failure("decoder exploded");
        let (tx, _rx) = mpsc::channel(8);
        let samples = audio();
        let err = stt
            .transcribe(
                UtteranceAudio {
                    samples: &samples,
                    sample_rate: 16_000,
                },
                &tx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SttError::Transcription(_)));
    }
}
