/// Transcription output events for one utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    /// Advisory in-progress hypothesis; may be suppressed entirely.
    Partial { text: String },
    /// The single final transcript for the utterance.
    Final { text: String },
}
