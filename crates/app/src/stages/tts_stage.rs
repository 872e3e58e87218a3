//! The TTS parent stage: utterances in, synthesized audio frames out,
//! with the actual synthesis running in a supervised worker process.

use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use voxloop_frames::{Frame, FrameSequencer, Interrupt};
use voxloop_telemetry::PipelineMetrics;
use voxloop_tts::{protocol, TtsError, TtsSupervisor, WorkerRequest, WorkerResponse};

use crate::turn::SpeakEvent;

pub const FIRST_AUDIO_TIMEOUT: Duration = Duration::from_secs(2);
pub const UTTERANCE_TIMEOUT: Duration = Duration::from_secs(15);

/// Bound on the audio-out queue. When the client stops draining, this is
/// what makes the stage stop pulling from the worker.
pub const AUDIO_OUT_DEPTH: usize = 32;

enum UtteranceOutcome {
    Complete,
    Cancelled,
    Failed { message: String, recoverable: bool },
}

pub struct TtsStage {
    utterance_rx: mpsc::Receiver<Frame>,
    out_tx: mpsc::Sender<Frame>,
    speak_tx: mpsc::Sender<SpeakEvent>,
    interrupt_rx: broadcast::Receiver<Interrupt>,
    supervisor: TtsSupervisor,
    voice_id: Option<String>,
    seq: FrameSequencer,
    metrics: PipelineMetrics,
    first_audio_timeout: Duration,
    utterance_timeout: Duration,
    cancelled_through: Option<u64>,
    interrupt_closed: bool,
}

impl TtsStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        utterance_rx: mpsc::Receiver<Frame>,
        out_tx: mpsc::Sender<Frame>,
        speak_tx: mpsc::Sender<SpeakEvent>,
        interrupt_rx: broadcast::Receiver<Interrupt>,
        supervisor: TtsSupervisor,
        voice_id: Option<String>,
        seq: FrameSequencer,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            utterance_rx,
            out_tx,
            speak_tx,
            interrupt_rx,
            supervisor,
            voice_id,
            seq,
            metrics,
            first_audio_timeout: FIRST_AUDIO_TIMEOUT,
            utterance_timeout: UTTERANCE_TIMEOUT,
            cancelled_through: None,
            interrupt_closed: false,
        }
    }

    fn is_cancelled(&self, turn_id: u64) -> bool {
        self.cancelled_through
            .map(|through| turn_id <= through)
            .unwrap_or(false)
    }

    fn note_cancel(&mut self, turn_id: u64) {
        self.cancelled_through = Some(
            self.cancelled_through
                .map_or(turn_id, |t| t.max(turn_id)),
        );
    }

    pub async fn run(mut self) {
        info!(target: "tts", "stage started");
        loop {
            tokio::select! {
                biased;

                interrupt = self.interrupt_rx.recv(), if !self.interrupt_closed => {
                    match interrupt {
                        Ok(signal) => self.note_cancel(signal.turn_id),
                        Err(broadcast::error::RecvError::Closed) => self.interrupt_closed = true,
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }

                frame = self.utterance_rx.recv() => {
                    let Some(frame) = frame else { break };
                    self.handle_frame(frame).await;
                }
            }
        }
        self.supervisor.shutdown().await;
        info!(target: "tts", "stage stopping");
    }

    async fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Utterance {
                meta,
                text,
                char_end,
            } => {
                if self.is_cancelled(meta.turn_id) {
                    debug!(target: "tts", turn_id = meta.turn_id, "stale utterance dropped");
                    return;
                }
                match self.speak_utterance(meta.turn_id, &text, char_end).await {
                    UtteranceOutcome::Complete => {}
                    UtteranceOutcome::Cancelled => {
                        self.note_cancel(meta.turn_id);
                    }
                    UtteranceOutcome::Failed {
                        message,
                        recoverable,
                    } => {
                        self.note_cancel(meta.turn_id);
                        PipelineMetrics::bump(&self.metrics.tts_errors);
                        let _ = self
                            .speak_tx
                            .send(SpeakEvent::Failed {
                                turn_id: meta.turn_id,
                                message,
                                recoverable,
                            })
                            .await;
                    }
                }
            }
            Frame::LlmDone { meta } => {
                if self.is_cancelled(meta.turn_id) {
                    return;
                }
                let _ = self
                    .speak_tx
                    .send(SpeakEvent::TurnAudioDone {
                        turn_id: meta.turn_id,
                    })
                    .await;
            }
            other => {
                debug!(target: "tts", tag = other.tag(), "ignoring frame");
            }
        }
    }

    async fn speak_utterance(
        &mut self,
        turn_id: u64,
        text: &str,
        char_end: usize,
    ) -> UtteranceOutcome {
        if let Err(e) = self.supervisor.ensure_started().await {
            warn!(target: "tts", "worker failed to start: {e}");
            return UtteranceOutcome::Failed {
                message: format!("synthesis worker failed to start: {e}"),
                recoverable: false,
            };
        }

        let mut request = WorkerRequest::speak(text);
        request.voice_id = self.voice_id.clone();
        if let Err(e) = self.supervisor.send_request(&request).await {
            warn!(target: "tts", turn_id, "request write failed: {e}");
            return self.handle_worker_death().await;
        }

        let started = Instant::now();
        let mut got_audio = false;

        loop {
            let budget = if got_audio {
                self.utterance_timeout.saturating_sub(started.elapsed())
            } else {
                self.first_audio_timeout
            };
            if budget.is_zero() {
                return self.handle_worker_timeout(turn_id).await;
            }

            let response = tokio::select! {
                biased;

                interrupt = self.interrupt_rx.recv(), if !self.interrupt_closed => {
                    match interrupt {
                        Ok(signal) => {
                            self.note_cancel(signal.turn_id);
                            if signal.turn_id >= turn_id {
                                debug!(target: "tts", turn_id, "utterance cancelled mid-stream");
                                self.drain_after_cancel().await;
                                return UtteranceOutcome::Cancelled;
                            }
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            self.interrupt_closed = true;
                            continue;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }

                response = tokio::time::timeout(budget, self.supervisor.next_response()) => response,
            };

            let response = match response {
                Err(_) => return self.handle_worker_timeout(turn_id).await,
                Ok(Err(TtsError::ChildExit)) => {
                    warn!(target: "tts", turn_id, "worker died mid-utterance");
                    return self.handle_worker_death().await;
                }
                Ok(Err(e)) => {
                    // A desynchronized protocol stream is not worth trusting.
                    warn!(target: "tts", turn_id, "worker protocol failure: {e}");
                    return self.handle_worker_death().await;
                }
                Ok(Ok(response)) => response,
            };

            match response {
                WorkerResponse::Started => {
                    let frame = Frame::TtsStarted {
                        meta: self.seq.next(turn_id),
                    };
                    if !self.forward(turn_id, frame).await {
                        return UtteranceOutcome::Cancelled;
                    }
                    let _ = self.speak_tx.send(SpeakEvent::Started { turn_id }).await;
                }
                WorkerResponse::AudioChunk { sample_rate, data } => {
                    let pcm = match protocol::decode_audio_chunk(&data) {
                        Ok(pcm) => pcm,
                        Err(e) => {
                            warn!(target: "tts", "undecodable audio chunk: {e}");
                            return self.handle_worker_death().await;
                        }
                    };
                    got_audio = true;
                    let frame = Frame::AudioOut {
                        meta: self.seq.next(turn_id),
                        pcm,
                        sample_rate,
                        channels: 1,
                    };
                    if !self.forward(turn_id, frame).await {
                        return UtteranceOutcome::Cancelled;
                    }
                }
                WorkerResponse::Stopped => {
                    let frame = Frame::TtsStopped {
                        meta: self.seq.next(turn_id),
                    };
                    if !self.forward(turn_id, frame).await {
                        return UtteranceOutcome::Cancelled;
                    }
                    let _ = self
                        .speak_tx
                        .send(SpeakEvent::Stopped {
                            turn_id,
                            char_end,
                            text: text.to_string(),
                        })
                        .await;
                }
                WorkerResponse::Eof => {
                    return UtteranceOutcome::Complete;
                }
                WorkerResponse::Error { message } => {
                    warn!(target: "tts", turn_id, "worker reported: {message}");
                    self.drain_after_cancel().await;
                    return UtteranceOutcome::Failed {
                        message,
                        recoverable: true,
                    };
                }
            }
        }
    }

    /// Push one frame toward the client, staying interruptible while the
    /// out queue is full. Returns false when the utterance was cancelled.
    async fn forward(&mut self, turn_id: u64, frame: Frame) -> bool {
        loop {
            tokio::select! {
                biased;

                interrupt = self.interrupt_rx.recv(), if !self.interrupt_closed => {
                    match interrupt {
                        Ok(signal) => {
                            self.note_cancel(signal.turn_id);
                            if signal.turn_id >= turn_id {
                                self.drain_after_cancel().await;
                                return false;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => self.interrupt_closed = true,
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }

                sent = self.out_tx.send(frame.clone()) => {
                    return sent.is_ok();
                }
            }
        }
    }

    /// After a cancellation, read out the rest of the current response
    /// stream so the next request starts on a framed boundary.
    async fn drain_after_cancel(&mut self) {
        match tokio::time::timeout(self.utterance_timeout, self.supervisor.drain_to_eof()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(target: "tts", "drain failed: {e}");
                let _ = self.supervisor.note_worker_death().await;
            }
            Err(_) => {
                warn!(target: "tts", "drain timed out, recycling worker");
                let _ = self.supervisor.note_worker_death().await;
            }
        }
    }

    async fn handle_worker_death(&mut self) -> UtteranceOutcome {
        match self.supervisor.note_worker_death().await {
            Ok(()) => {
                PipelineMetrics::bump(&self.metrics.tts_restarts);
                UtteranceOutcome::Failed {
                    message: "synthesis worker exited, respawning".to_string(),
                    recoverable: true,
                }
            }
            Err(_) => UtteranceOutcome::Failed {
                message: "synthesis worker exited, restart budget exhausted".to_string(),
                recoverable: false,
            },
        }
    }

    async fn handle_worker_timeout(&mut self, turn_id: u64) -> UtteranceOutcome {
        warn!(target: "tts", turn_id, "worker missed its deadline, recycling");
        // The worker is wedged; a drain would hang too.
        match self.supervisor.note_worker_death().await {
            Ok(()) => {
                PipelineMetrics::bump(&self.metrics.tts_restarts);
                UtteranceOutcome::Failed {
                    message: "synthesis deadline exceeded".to_string(),
                    recoverable: true,
                }
            }
            Err(_) => UtteranceOutcome::Failed {
                message: "synthesis deadline exceeded, restart budget exhausted".to_string(),
                recoverable: false,
            },
        }
    }
}
