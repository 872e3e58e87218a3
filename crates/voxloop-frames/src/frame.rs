use serde::{Deserialize, Serialize};

use voxloop_foundation::ErrorKind;

use crate::message::ChatMessage;

/// Per-frame bookkeeping: a session-monotonic sequence id and the id of the
/// turn the frame belongs to.
///
/// Turns count from 1; id 0 appears only on frames that precede any turn.
/// Frames stamped with a retired turn id are dropped at the next stage
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMeta {
    pub seq: u64,
    pub turn_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    /// The user started speaking while the bot was speaking.
    UserSpeech,
    /// The client sent an explicit interrupt on the control plane.
    Client,
    /// A stage failed and the turn is being torn down.
    TurnAbort,
    /// The session is tearing down.
    SessionEnd,
}

/// The interruption signal broadcast on the side channel.
///
/// Carried both standalone (broadcast subscribers) and as [`Frame::Interrupt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupt {
    pub turn_id: u64,
    pub reason: InterruptReason,
}

/// Session lifecycle markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemKind {
    Start,
    Stop,
    Drain,
}

/// A typed message flowing through the pipeline.
///
/// Audio payloads are 16-bit little-endian linear PCM. `pcm` byte lengths
/// are always even.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Raw capture audio from the client.
    AudioIn {
        meta: FrameMeta,
        pcm: Vec<u8>,
        sample_rate: u32,
        channels: u16,
        timestamp_ms: u64,
    },
    /// Synthesized playback audio toward the client.
    AudioOut {
        meta: FrameMeta,
        pcm: Vec<u8>,
        sample_rate: u32,
        channels: u16,
    },
    /// Speech onset detected by the VAD gate.
    VadStart { meta: FrameMeta },
    /// Speech offset detected by the VAD gate (after the silence hold-off).
    VadEnd { meta: FrameMeta },
    /// A complete segmented utterance, padded and ready for transcription.
    UserSpeech {
        meta: FrameMeta,
        pcm: Vec<u8>,
        sample_rate: u32,
    },
    /// STT output. Non-final transcripts are advisory.
    Transcript {
        meta: FrameMeta,
        text: String,
        is_final: bool,
    },
    /// Assembled model input: system message, history, current user turn.
    Prompt {
        meta: FrameMeta,
        messages: Vec<ChatMessage>,
    },
    /// One streamed chunk of model output.
    LlmToken { meta: FrameMeta, delta: String },
    /// End of the model stream for this turn.
    LlmDone { meta: FrameMeta },
    /// A sentence-granular chunk ready for synthesis. `char_end` is the
    /// cumulative character offset of this chunk's end within the turn's
    /// assistant text, used for interruption truncation.
    Utterance {
        meta: FrameMeta,
        text: String,
        char_end: usize,
    },
    /// Bot audio stream boundaries, per utterance.
    TtsStarted { meta: FrameMeta },
    TtsStopped { meta: FrameMeta },
    /// Cancellation of in-flight generation and playback.
    Interrupt { meta: FrameMeta, signal: Interrupt },
    Error {
        meta: FrameMeta,
        kind: ErrorKind,
        message: String,
        recoverable: bool,
    },
    /// Session lifecycle. The only variant that belongs to no turn.
    System { kind: SystemKind },
}

impl Frame {
    /// The turn this frame belongs to, if any.
    pub fn turn_id(&self) -> Option<u64> {
        self.meta().map(|m| m.turn_id)
    }

    pub fn meta(&self) -> Option<FrameMeta> {
        match self {
            Frame::AudioIn { meta, .. }
            | Frame::AudioOut { meta, .. }
            | Frame::VadStart { meta }
            | Frame::VadEnd { meta }
            | Frame::UserSpeech { meta, .. }
            | Frame::Transcript { meta, .. }
            | Frame::Prompt { meta, .. }
            | Frame::LlmToken { meta, .. }
            | Frame::LlmDone { meta }
            | Frame::Utterance { meta, .. }
            | Frame::TtsStarted { meta }
            | Frame::TtsStopped { meta }
            | Frame::Interrupt { meta, .. }
            | Frame::Error { meta, .. } => Some(*meta),
            Frame::System { .. } => None,
        }
    }

    /// Short tag for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Frame::AudioIn { .. } => "audio_in",
            Frame::AudioOut { .. } => "audio_out",
            Frame::VadStart { .. } => "vad_start",
            Frame::VadEnd { .. } => "vad_end",
            Frame::UserSpeech { .. } => "user_speech",
            Frame::Transcript { .. } => "transcript",
            Frame::Prompt { .. } => "prompt",
            Frame::LlmToken { .. } => "llm_token",
            Frame::LlmDone { .. } => "llm_done",
            Frame::Utterance { .. } => "utterance",
            Frame::TtsStarted { .. } => "tts_started",
            Frame::TtsStopped { .. } => "tts_stopped",
            Frame::Interrupt { .. } => "interrupt",
            Frame::Error { .. } => "error",
            Frame::System { .. } => "system",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_frames_belong_to_no_turn() {
        let f = Frame::System {
            kind: SystemKind::Drain,
        };
        assert!(f.turn_id().is_none());
    }

    #[test]
    fn meta_is_uniform_across_variants() {
        let meta = FrameMeta { seq: 7, turn_id: 3 };
        let frames = [
            Frame::VadStart { meta },
            Frame::LlmDone { meta },
            Frame::Transcript {
                meta,
                text: "hi".into(),
                is_final: true,
            },
        ];
        for f in frames {
            assert_eq!(f.turn_id(), Some(3));
            assert_eq!(f.meta().unwrap().seq, 7);
        }
    }
}
