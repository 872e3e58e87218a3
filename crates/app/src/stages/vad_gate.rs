//! The VAD gate: raw capture audio in, speech boundary markers and
//! segmented utterances out.
//!
//! The gate is also where barge-in originates: speech onset while the
//! controller reports SPEAKING raises an interrupt on the side channel.

use std::collections::VecDeque;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use voxloop_frames::{pcm, Frame, FrameSequencer, Interrupt, InterruptReason};
use voxloop_telemetry::PipelineMetrics;
use voxloop_vad::{VadEngine, VadEvent, WindowChunker};

use crate::turn::ControllerStatus;

pub struct VadGate {
    audio_rx: mpsc::Receiver<Frame>,
    events_tx: mpsc::Sender<Frame>,
    speech_tx: mpsc::Sender<Frame>,
    interrupt_tx: broadcast::Sender<Interrupt>,
    status_rx: watch::Receiver<ControllerStatus>,
    engine: Box<dyn VadEngine>,
    chunker: WindowChunker,
    seq: FrameSequencer,
    metrics: PipelineMetrics,

    /// Ring of pre-speech audio prepended to each utterance.
    pad: VecDeque<i16>,
    pad_cap: usize,
    utterance: Vec<i16>,
    in_speech: bool,
    /// Turn ids originate here, at speech onset.
    next_turn_id: u64,
    current_turn_id: u64,
    sample_rate: u32,
}

impl VadGate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        audio_rx: mpsc::Receiver<Frame>,
        events_tx: mpsc::Sender<Frame>,
        speech_tx: mpsc::Sender<Frame>,
        interrupt_tx: broadcast::Sender<Interrupt>,
        status_rx: watch::Receiver<ControllerStatus>,
        engine: Box<dyn VadEngine>,
        pad_samples: usize,
        seq: FrameSequencer,
        metrics: PipelineMetrics,
    ) -> Self {
        let window = engine.window_size_samples();
        let sample_rate = engine.sample_rate_hz();
        Self {
            audio_rx,
            events_tx,
            speech_tx,
            interrupt_tx,
            status_rx,
            engine,
            chunker: WindowChunker::new(window),
            seq,
            metrics,
            pad: VecDeque::with_capacity(pad_samples),
            pad_cap: pad_samples,
            utterance: Vec::new(),
            in_speech: false,
            next_turn_id: 1,
            current_turn_id: 0,
            sample_rate,
        }
    }

    pub async fn run(mut self) {
        info!(target: "vad", "gate started");
        while let Some(frame) = self.audio_rx.recv().await {
            match frame {
                Frame::AudioIn {
                    pcm: bytes,
                    sample_rate,
                    ..
                } => {
                    if sample_rate != self.sample_rate {
                        warn!(
                            target: "vad",
                            got = sample_rate,
                            want = self.sample_rate,
                            "capture rate mismatch, block dropped"
                        );
                        continue;
                    }
                    self.process_block(&bytes).await;
                }
                other => {
                    debug!(target: "vad", tag = other.tag(), "ignoring frame");
                }
            }
        }
        info!(target: "vad", "gate stopping");
    }

    async fn process_block(&mut self, bytes: &[u8]) {
        self.chunker.push(&pcm::bytes_to_samples(bytes));
        while let Some(window) = self.chunker.next_window() {
            let event = match self.engine.process(&window) {
                Ok(event) => event,
                Err(e) => {
                    warn!(target: "vad", "window rejected: {e}");
                    continue;
                }
            };

            match event {
                None => {
                    if self.in_speech {
                        self.utterance.extend_from_slice(&window);
                    } else {
                        self.buffer_pad(&window);
                    }
                }
                Some(VadEvent::SpeechStart { timestamp_ms }) => {
                    self.on_speech_start(timestamp_ms, &window).await;
                }
                Some(VadEvent::SpeechEnd { duration_ms, .. }) => {
                    self.utterance.extend_from_slice(&window);
                    self.on_speech_end(duration_ms).await;
                }
            }
        }
    }

    fn buffer_pad(&mut self, window: &[i16]) {
        self.pad.extend(window.iter().copied());
        while self.pad.len() > self.pad_cap {
            self.pad.pop_front();
        }
    }

    async fn on_speech_start(&mut self, timestamp_ms: u64, window: &[i16]) {
        self.in_speech = true;
        self.current_turn_id = self.next_turn_id;
        self.next_turn_id += 1;

        // Padding plus the onset window opens the utterance.
        self.utterance.clear();
        self.utterance.extend(self.pad.drain(..));
        self.utterance.extend_from_slice(window);

        debug!(
            target: "vad",
            turn_id = self.current_turn_id,
            timestamp_ms,
            "speech start"
        );

        // Barge-in: the one and only user-side interruption mechanism.
        let status = *self.status_rx.borrow();
        if status.speaking {
            info!(
                target: "vad",
                interrupting = status.turn_id,
                "user speech during bot speech, interrupting"
            );
            let _ = self.interrupt_tx.send(Interrupt {
                turn_id: status.turn_id,
                reason: InterruptReason::UserSpeech,
            });
        }

        let _ = self
            .events_tx
            .send(Frame::VadStart {
                meta: self.seq.next(self.current_turn_id),
            })
            .await;
    }

    async fn on_speech_end(&mut self, duration_ms: u64) {
        self.in_speech = false;
        let samples = std::mem::take(&mut self.utterance);
        debug!(
            target: "vad",
            turn_id = self.current_turn_id,
            duration_ms,
            samples = samples.len(),
            "speech end"
        );
        PipelineMetrics::bump(&self.metrics.speech_segments);

        let _ = self
            .events_tx
            .send(Frame::VadEnd {
                meta: self.seq.next(self.current_turn_id),
            })
            .await;
        let _ = self
            .speech_tx
            .send(Frame::UserSpeech {
                meta: self.seq.next(self.current_turn_id),
                pcm: pcm::samples_to_bytes(&samples),
                sample_rate: self.sample_rate,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxloop_vad::{EnergyVad, VadConfig};

    struct Harness {
        audio_tx: mpsc::Sender<Frame>,
        events_rx: mpsc::Receiver<Frame>,
        speech_rx: mpsc::Receiver<Frame>,
        status_tx: watch::Sender<ControllerStatus>,
        interrupt_rx: broadcast::Receiver<Interrupt>,
        seq: FrameSequencer,
        handle: tokio::task::JoinHandle<()>,
    }

    fn spawn_gate() -> Harness {
        let (audio_tx, audio_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(64);
        let (speech_tx, speech_rx) = mpsc::channel(64);
        let (interrupt_tx, interrupt_rx) = broadcast::channel(8);
        let (status_tx, status_rx) = watch::channel(ControllerStatus::default());
        let seq = FrameSequencer::new();
        let cfg = VadConfig::default();

        let gate = VadGate::new(
            audio_rx,
            events_tx,
            speech_tx,
            interrupt_tx,
            status_rx,
            Box::new(EnergyVad::new(cfg.clone())),
            cfg.pad_samples(),
            seq.clone(),
            PipelineMetrics::new(),
        );
        let handle = tokio::spawn(gate.run());
        Harness {
            audio_tx,
            events_rx,
            speech_rx,
            status_tx,
            interrupt_rx,
            seq,
            handle,
        }
    }

    fn audio_frame(seq: &FrameSequencer, samples: &[i16]) -> Frame {
        Frame::AudioIn {
            meta: seq.next(0),
            pcm: pcm::samples_to_bytes(samples),
            sample_rate: 16_000,
            channels: 1,
            timestamp_ms: 0,
        }
    }

    fn loud(ms: u32) -> Vec<i16> {
        let n = (16_000 * ms as usize) / 1000;
        (0..n)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / 32.0;
                (phase.sin() * 12_000.0) as i16
            })
            .collect()
    }

    fn quiet(ms: u32) -> Vec<i16> {
        vec![0i16; (16_000 * ms as usize) / 1000]
    }

    #[tokio::test]
    async fn speech_burst_yields_markers_and_utterance() {
        let mut h = spawn_gate();

        h.audio_tx.send(audio_frame(&h.seq, &quiet(200))).await.unwrap();
        h.audio_tx.send(audio_frame(&h.seq, &loud(600))).await.unwrap();
        h.audio_tx.send(audio_frame(&h.seq, &quiet(400))).await.unwrap();
        drop(h.audio_tx);

        let start = h.events_rx.recv().await.unwrap();
        assert!(matches!(start, Frame::VadStart { meta } if meta.turn_id == 1));
        let end = h.events_rx.recv().await.unwrap();
        assert!(matches!(end, Frame::VadEnd { meta } if meta.turn_id == 1));

        let speech = h.speech_rx.recv().await.unwrap();
        match speech {
            Frame::UserSpeech {
                meta,
                pcm: bytes,
                sample_rate,
            } => {
                assert_eq!(meta.turn_id, 1);
                assert_eq!(sample_rate, 16_000);
                // Utterance must cover the speech plus padding, in PCM16.
                assert!(bytes.len() > 16_000, "only {} bytes", bytes.len());
                assert_eq!(bytes.len() % 2, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn onset_during_bot_speech_raises_interrupt() {
        let mut h = spawn_gate();
        h.status_tx
            .send(ControllerStatus {
                turn_id: 7,
                speaking: true,
            })
            .unwrap();

        h.audio_tx.send(audio_frame(&h.seq, &loud(400))).await.unwrap();

        let signal = h.interrupt_rx.recv().await.unwrap();
        assert_eq!(signal.turn_id, 7);
        assert_eq!(signal.reason, InterruptReason::UserSpeech);

        drop(h.audio_tx);
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn silence_produces_nothing() {
        let mut h = spawn_gate();
        h.audio_tx.send(audio_frame(&h.seq, &quiet(1000))).await.unwrap();
        drop(h.audio_tx);
        h.handle.await.unwrap();
        assert!(h.events_rx.recv().await.is_none());
        assert!(h.speech_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn consecutive_bursts_get_distinct_turn_ids() {
        let mut h = spawn_gate();

        h.audio_tx.send(audio_frame(&h.seq, &loud(400))).await.unwrap();
        h.audio_tx.send(audio_frame(&h.seq, &quiet(400))).await.unwrap();
        h.audio_tx.send(audio_frame(&h.seq, &loud(400))).await.unwrap();
        h.audio_tx.send(audio_frame(&h.seq, &quiet(400))).await.unwrap();
        drop(h.audio_tx);

        let mut turn_ids = Vec::new();
        while let Some(frame) = h.events_rx.recv().await {
            if let Frame::VadStart { meta } = frame {
                turn_ids.push(meta.turn_id);
            }
        }
        assert_eq!(turn_ids, vec![1, 2]);
        h.handle.await.unwrap();
    }
}
