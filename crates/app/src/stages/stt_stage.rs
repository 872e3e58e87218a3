//! The STT stage: one complete utterance in, zero or more advisory
//! transcripts plus exactly one final transcript out.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use voxloop_foundation::ErrorKind;
use voxloop_frames::{pcm, Frame, FrameSequencer, Interrupt};
use voxloop_stt::{SpeechToText, TranscriptEvent, UtteranceAudio};

pub const STT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SttStage<T: SpeechToText> {
    speech_rx: mpsc::Receiver<Frame>,
    events_tx: mpsc::Sender<Frame>,
    interrupt_rx: broadcast::Receiver<Interrupt>,
    engine: T,
    seq: FrameSequencer,
    timeout: Duration,
    cancelled_through: Option<u64>,
    interrupt_closed: bool,
}

impl<T: SpeechToText> SttStage<T> {
    pub fn new(
        speech_rx: mpsc::Receiver<Frame>,
        events_tx: mpsc::Sender<Frame>,
        interrupt_rx: broadcast::Receiver<Interrupt>,
        engine: T,
        seq: FrameSequencer,
    ) -> Self {
        Self {
            speech_rx,
            events_tx,
            interrupt_rx,
            engine,
            seq,
            timeout: STT_TIMEOUT,
            cancelled_through: None,
            interrupt_closed: false,
        }
    }

    #[cfg(test)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn is_cancelled(&self, turn_id: u64) -> bool {
        self.cancelled_through
            .map(|through| turn_id <= through)
            .unwrap_or(false)
    }

    fn note_interrupt(&mut self, turn_id: u64) {
        self.cancelled_through = Some(
            self.cancelled_through
                .map_or(turn_id, |t| t.max(turn_id)),
        );
    }

    pub async fn run(mut self) {
        info!(target: "stt", engine = self.engine.name(), "stage started");
        loop {
            tokio::select! {
                biased;

                interrupt = self.interrupt_rx.recv(), if !self.interrupt_closed => {
                    match interrupt {
                        Ok(signal) => self.note_interrupt(signal.turn_id),
                        Err(broadcast::error::RecvError::Closed) => self.interrupt_closed = true,
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }

                frame = self.speech_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if let Frame::UserSpeech { meta, pcm: bytes, sample_rate } = frame {
                        if self.is_cancelled(meta.turn_id) {
                            debug!(target: "stt", turn_id = meta.turn_id, "stale utterance dropped");
                            continue;
                        }
                        self.transcribe_utterance(meta.turn_id, &bytes, sample_rate).await;
                    }
                }
            }
        }
        info!(target: "stt", "stage stopping");
    }

    async fn transcribe_utterance(&mut self, turn_id: u64, bytes: &[u8], sample_rate: u32) {
        let samples = pcm::bytes_to_samples(bytes);
        let audio = UtteranceAudio {
            samples: &samples,
            sample_rate,
        };
        debug!(
            target: "stt",
            turn_id,
            duration_ms = audio.duration_ms(),
            "transcribing utterance"
        );

        let (event_tx, mut event_rx) = mpsc::channel::<TranscriptEvent>(16);

        // Forward transcript events as they arrive so partials stay live
        // while the engine keeps decoding.
        let forward_tx = self.events_tx.clone();
        let forward_seq = self.seq.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let frame = match event {
                    TranscriptEvent::Partial { text } => Frame::Transcript {
                        meta: forward_seq.next(turn_id),
                        text,
                        is_final: false,
                    },
                    TranscriptEvent::Final { text } => Frame::Transcript {
                        meta: forward_seq.next(turn_id),
                        text,
                        is_final: true,
                    },
                };
                if forward_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        // Run the decode against the interrupt channel: an interrupt for
        // this turn (or a later one) abandons the in-flight future.
        let mut cancelled_through = self.cancelled_through;
        let mut interrupt_closed = self.interrupt_closed;
        let result = {
            let decode =
                tokio::time::timeout(self.timeout, self.engine.transcribe(audio, &event_tx));
            tokio::pin!(decode);
            loop {
                tokio::select! {
                    biased;

                    interrupt = self.interrupt_rx.recv(), if !interrupt_closed => {
                        match interrupt {
                            Ok(signal) => {
                                cancelled_through = Some(
                                    cancelled_through.map_or(signal.turn_id, |t| t.max(signal.turn_id)),
                                );
                                if signal.turn_id >= turn_id {
                                    debug!(target: "stt", turn_id, "transcription cancelled");
                                    break None;
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => interrupt_closed = true,
                            Err(broadcast::error::RecvError::Lagged(_)) => {}
                        }
                    }

                    result = &mut decode => break Some(result),
                }
            }
        };
        self.cancelled_through = cancelled_through;
        self.interrupt_closed = interrupt_closed;

        drop(event_tx);
        let _ = forwarder.await;

        match result {
            None | Some(Ok(Ok(()))) => {}
            Some(Ok(Err(e))) => {
                warn!(target: "stt", turn_id, "transcription failed: {e}");
                let _ = self
                    .events_tx
                    .send(Frame::Error {
                        meta: self.seq.next(turn_id),
                        kind: ErrorKind::Stt,
                        message: e.to_string(),
                        recoverable: true,
                    })
                    .await;
            }
            Some(Err(_)) => {
                warn!(target: "stt", turn_id, "transcription timed out");
                let _ = self
                    .events_tx
                    .send(Frame::Error {
                        meta: self.seq.next(turn_id),
                        kind: ErrorKind::Stt,
                        message: format!("transcription exceeded {:?}", self.timeout),
                        recoverable: true,
                    })
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxloop_stt::ScriptedStt;

    struct Harness {
        speech_tx: mpsc::Sender<Frame>,
        events_rx: mpsc::Receiver<Frame>,
        interrupt_tx: broadcast::Sender<Interrupt>,
        seq: FrameSequencer,
        handle: tokio::task::JoinHandle<()>,
    }

    fn spawn_stage(engine: ScriptedStt) -> Harness {
        spawn_stage_with(engine, STT_TIMEOUT)
    }

    fn spawn_stage_with(engine: ScriptedStt, timeout: Duration) -> Harness {
        let (speech_tx, speech_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::channel(16);
        let (interrupt_tx, interrupt_rx) = broadcast::channel(8);
        let seq = FrameSequencer::new();
        let stage = SttStage::new(speech_rx, events_tx, interrupt_rx, engine, seq.clone())
            .with_timeout(timeout);
        let handle = tokio::spawn(stage.run());
        Harness {
            speech_tx,
            events_rx,
            interrupt_tx,
            seq,
            handle,
        }
    }

    fn utterance(seq: &FrameSequencer, turn_id: u64) -> Frame {
        Frame::UserSpeech {
            meta: seq.next(turn_id),
            pcm: vec![0u8; 3200],
            sample_rate: 16_000,
        }
    }

    #[tokio::test]
    async fn final_transcript_is_forwarded() {
        let mut h = spawn_stage(ScriptedStt::new().with_transcript("what is two plus two"));
        h.speech_tx.send(utterance(&h.seq, 1)).await.unwrap();
        drop(h.speech_tx);

        let frame = h.events_rx.recv().await.unwrap();
        match frame {
            Frame::Transcript {
                meta,
                text,
                is_final,
            } => {
                assert_eq!(meta.turn_id, 1);
                assert_eq!(text, "what is two plus two");
                assert!(is_final);
            }
            other => panic!("unexpected {other:?}"),
        }
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn partials_arrive_before_final() {
        let mut h = spawn_stage(
            ScriptedStt::new().with_partials(vec!["wh".into(), "what".into()], "what time is it"),
        );
        h.speech_tx.send(utterance(&h.seq, 1)).await.unwrap();
        drop(h.speech_tx);

        let mut finals = 0;
        let mut partials = 0;
        while let Some(frame) = h.events_rx.recv().await {
            if let Frame::Transcript { is_final, .. } = frame {
                if is_final {
                    finals += 1;
                } else {
                    partials += 1;
                }
            }
        }
        assert_eq!((partials, finals), (2, 1));
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn failure_becomes_recoverable_stt_error() {
        let mut h = spawn_stage(ScriptedStt::new().with_failure("no model"));
        h.speech_tx.send(utterance(&h.seq, 3)).await.unwrap();
        drop(h.speech_tx);

        let frame = h.events_rx.recv().await.unwrap();
        match frame {
            Frame::Error {
                meta,
                kind,
                recoverable,
                ..
            } => {
                assert_eq!(meta.turn_id, 3);
                assert_eq!(kind, ErrorKind::Stt);
                assert!(recoverable);
            }
            other => panic!("unexpected {other:?}"),
        }
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn slow_engine_times_out() {
        let h_engine = ScriptedStt::new()
            .with_transcript("late")
            .with_delay(Duration::from_millis(200));
        let mut h = spawn_stage_with(h_engine, Duration::from_millis(20));
        h.speech_tx.send(utterance(&h.seq, 1)).await.unwrap();
        drop(h.speech_tx);

        let frame = h.events_rx.recv().await.unwrap();
        assert!(matches!(
            frame,
            Frame::Error {
                kind: ErrorKind::Stt,
                recoverable: true,
                ..
            }
        ));
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn interrupted_turn_is_dropped_before_decode() {
        let mut h = spawn_stage(ScriptedStt::new().with_transcript("never seen"));
        h.interrupt_tx
            .send(Interrupt {
                turn_id: 5,
                reason: voxloop_frames::InterruptReason::Client,
            })
            .unwrap();
        tokio::task::yield_now().await;
        h.speech_tx.send(utterance(&h.seq, 5)).await.unwrap();
        drop(h.speech_tx);
        drop(h.interrupt_tx);

        h.handle.await.unwrap();
        assert!(h.events_rx.recv().await.is_none());
    }
}
