//! The turn controller: one per session.
//!
//! Owns the conversation state machine and the context store. Everything
//! the controller learns arrives on its event channels; everything it
//! decides leaves as frames or broadcast interrupts. Context commits happen
//! only at turn commit points, so cancellation anywhere else is safe.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use voxloop_frames::{ChatMessage, Frame, FrameSequencer, Interrupt, InterruptReason, SystemKind};
use voxloop_foundation::ErrorKind;
use voxloop_telemetry::{MetricsSink, PipelineMetrics, TurnReport};

use super::context::ContextStore;
use super::types::{ControllerStatus, SpeakEvent, Turn, TurnState};

/// Future-turn frames buffered while the current turn finishes.
const PENDING_CAP: usize = 64;

/// Why the controller's run loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerOutcome {
    /// Graceful drain completed.
    Drained,
    /// The client went away.
    Disconnected,
    /// An unrecoverable error closed the session.
    Fatal,
}

pub struct TurnController {
    events_rx: mpsc::Receiver<Frame>,
    speak_rx: mpsc::Receiver<SpeakEvent>,
    interrupt_rx: broadcast::Receiver<Interrupt>,
    interrupt_tx: broadcast::Sender<Interrupt>,
    prompt_tx: mpsc::Sender<Frame>,
    out_tx: mpsc::Sender<Frame>,
    status_tx: watch::Sender<ControllerStatus>,
    seq: FrameSequencer,

    context: ContextStore,
    metrics: PipelineMetrics,
    sink: Arc<dyn MetricsSink>,

    current: Option<Turn>,
    /// Highest turn id ever retired; anything at or below it is stale.
    last_retired: u64,
    report: TurnReport,
    pending: Vec<Frame>,
    replay: VecDeque<Frame>,
    draining: bool,
    interrupt_closed: bool,
    outcome: Option<ControllerOutcome>,
}

impl TurnController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        events_rx: mpsc::Receiver<Frame>,
        speak_rx: mpsc::Receiver<SpeakEvent>,
        interrupt_rx: broadcast::Receiver<Interrupt>,
        interrupt_tx: broadcast::Sender<Interrupt>,
        prompt_tx: mpsc::Sender<Frame>,
        out_tx: mpsc::Sender<Frame>,
        status_tx: watch::Sender<ControllerStatus>,
        seq: FrameSequencer,
        context: ContextStore,
        metrics: PipelineMetrics,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            events_rx,
            speak_rx,
            interrupt_rx,
            interrupt_tx,
            prompt_tx,
            out_tx,
            status_tx,
            seq,
            context,
            metrics,
            sink,
            current: None,
            last_retired: 0,
            report: TurnReport::default(),
            pending: Vec::new(),
            replay: VecDeque::new(),
            draining: false,
            interrupt_closed: false,
            outcome: None,
        }
    }

    pub async fn run(mut self) -> ControllerOutcome {
        while self.outcome.is_none() {
            // Replayed frames take priority over fresh input so deferred
            // turns start before anything newer is looked at.
            if let Some(frame) = self.replay.pop_front() {
                self.handle_frame(frame).await;
                continue;
            }
            if self.draining && self.current.is_none() {
                self.finish_drain().await;
                continue;
            }

            tokio::select! {
                biased;

                interrupt = self.interrupt_rx.recv(), if !self.interrupt_closed => {
                    match interrupt {
                        Ok(signal) => {
                            self.apply_interrupt(signal.turn_id, signal.reason, false).await;
                        }
                        Err(broadcast::error::RecvError::Closed) => self.interrupt_closed = true,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(target: "turn", missed = n, "interrupt channel lagged");
                        }
                    }
                }

                event = self.speak_rx.recv() => {
                    match event {
                        Some(event) => self.handle_speak(event).await,
                        None => self.outcome = Some(ControllerOutcome::Disconnected),
                    }
                }

                frame = self.events_rx.recv() => {
                    match frame {
                        Some(frame) => self.handle_frame(frame).await,
                        None => self.outcome = Some(ControllerOutcome::Disconnected),
                    }
                }
            }
        }

        let outcome = self.outcome.unwrap_or(ControllerOutcome::Disconnected);
        info!(target: "turn", ?outcome, "controller stopping");
        outcome
    }

    // ── frame plane ─────────────────────────────────────────────────

    async fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::VadStart { meta } => {
                if self.draining {
                    debug!(target: "turn", "draining, new turn refused");
                    return;
                }
                match self.current.as_ref().map(|t| (t.id, t.state)) {
                    None => self.start_turn(meta.turn_id),
                    Some((id, TurnState::Speaking)) => {
                        // Barge-in: interruption before the next turn starts.
                        self.buffer_pending(Frame::VadStart { meta });
                        self.apply_interrupt(id, InterruptReason::UserSpeech, true).await;
                    }
                    Some((id, _)) if meta.turn_id > id => {
                        // The next utterance began while this turn is still
                        // being processed; defer it until the turn retires.
                        self.buffer_pending(Frame::VadStart { meta });
                    }
                    Some(_) => {}
                }
            }

            Frame::VadEnd { meta } => match &mut self.current {
                Some(turn) if turn.id == meta.turn_id && turn.state == TurnState::Listening => {
                    turn.state = TurnState::Transcribing;
                    self.report.t_vad_end = Some(turn.created_at.elapsed());
                    self.publish_status();
                }
                Some(turn) if meta.turn_id > turn.id => {
                    self.buffer_pending(Frame::VadEnd { meta });
                }
                _ => {}
            },

            Frame::Transcript {
                meta,
                text,
                is_final,
            } => {
                let current_id = self.current.as_ref().map(|t| t.id);
                match current_id {
                    Some(id) if id == meta.turn_id => {
                        self.handle_transcript(text, is_final).await;
                    }
                    Some(id) if meta.turn_id > id && is_final => {
                        self.buffer_pending(Frame::Transcript {
                            meta,
                            text,
                            is_final,
                        });
                    }
                    None if is_final && meta.turn_id > self.last_retired => {
                        // Transcript outran the replayed VadStart.
                        self.buffer_pending(Frame::Transcript {
                            meta,
                            text,
                            is_final,
                        });
                    }
                    _ => debug!(target: "turn", turn_id = meta.turn_id, "stale transcript dropped"),
                }
            }

            Frame::Error {
                meta,
                kind,
                message,
                recoverable,
            } => {
                self.handle_stage_error(meta.turn_id, kind, message, recoverable).await;
            }

            Frame::Interrupt { signal, .. } => {
                // Client interrupts arrive unresolved; aim at the live turn.
                if let Some(id) = self.current.as_ref().map(|t| t.id) {
                    let reason = signal.reason;
                    self.apply_interrupt(id, reason, true).await;
                }
            }

            Frame::LlmToken { meta, .. } => {
                // First-token timing signal from the LLM stage.
                if let Some(turn) = self.current.as_ref() {
                    if turn.id == meta.turn_id && self.report.t_llm_first_token.is_none() {
                        self.report.t_llm_first_token = Some(turn.created_at.elapsed());
                    }
                }
            }

            Frame::System { kind } => match kind {
                SystemKind::Drain => {
                    self.draining = true;
                    if self.current.is_none() {
                        self.finish_drain().await;
                    }
                }
                SystemKind::Stop => {
                    self.outcome = Some(ControllerOutcome::Disconnected);
                }
                SystemKind::Start => {}
            },

            other => {
                debug!(target: "turn", tag = other.tag(), "unexpected frame at controller");
            }
        }
    }

    async fn handle_transcript(&mut self, text: String, is_final: bool) {
        let Some(turn) = self.current.as_mut() else { return };
        if turn.state != TurnState::Transcribing {
            debug!(target: "turn", state = ?turn.state, "transcript outside transcription");
            return;
        }
        if !is_final {
            debug!(target: "turn", "partial: {text:?}");
            return;
        }

        self.report.t_stt_done = Some(turn.created_at.elapsed());
        if text.trim().is_empty() {
            // Silence-only utterance: no prompt, no context mutation.
            debug!(target: "turn", turn_id = turn.id, "empty utterance, retiring");
            turn.state = TurnState::Done;
            turn.finished_at = Some(Instant::now());
            self.retire().await;
            return;
        }

        turn.user_text = text;
        turn.state = TurnState::Thinking;
        let prompt = Frame::Prompt {
            meta: self.seq.next(turn.id),
            messages: assemble_prompt(&self.context, &turn.user_text),
        };
        self.publish_status();
        if self.prompt_tx.send(prompt).await.is_err() {
            warn!(target: "turn", "LLM stage gone");
            self.outcome = Some(ControllerOutcome::Fatal);
        }
    }

    async fn handle_stage_error(
        &mut self,
        turn_id: u64,
        kind: ErrorKind,
        message: String,
        recoverable: bool,
    ) {
        match kind {
            ErrorKind::Stt => PipelineMetrics::bump(&self.metrics.stt_errors),
            ErrorKind::Llm => PipelineMetrics::bump(&self.metrics.llm_errors),
            ErrorKind::Tts => PipelineMetrics::bump(&self.metrics.tts_errors),
            _ => {}
        }

        let is_current = self.current.as_ref().map(|t| t.id) == Some(turn_id);
        if is_current {
            // Cancel whatever the turn still has in flight, then abort it
            // with the context untouched.
            let _ = self.interrupt_tx.send(Interrupt {
                turn_id,
                reason: InterruptReason::TurnAbort,
            });
            self.emit_error(turn_id, kind, &message, recoverable).await;
            PipelineMetrics::bump(&self.metrics.turns_aborted);
            if let Some(turn) = self.current.as_mut() {
                turn.state = TurnState::Done;
                turn.finished_at = Some(Instant::now());
            }
            self.retire().await;
        } else if recoverable {
            debug!(target: "turn", turn_id, "stale stage error dropped");
        } else {
            self.emit_error(turn_id, kind, &message, recoverable).await;
        }

        if !recoverable {
            self.outcome = Some(ControllerOutcome::Fatal);
        }
    }

    // ── speak plane ─────────────────────────────────────────────────

    async fn handle_speak(&mut self, event: SpeakEvent) {
        match event {
            SpeakEvent::Started { turn_id } => {
                let Some(turn) = self.current.as_mut() else { return };
                if turn.id != turn_id {
                    return;
                }
                if turn.state == TurnState::Thinking {
                    turn.state = TurnState::Speaking;
                }
                if turn.first_audio_emitted_at.is_none() {
                    turn.first_audio_emitted_at = Some(Instant::now());
                    self.report.t_tts_first_audio = Some(turn.created_at.elapsed());
                }
                self.publish_status();

                // The user already started speaking while we were thinking;
                // entering SPEAKING makes that an immediate barge-in.
                if self.pending.iter().any(|f| matches!(f, Frame::VadStart { .. })) {
                    self.apply_interrupt(turn_id, InterruptReason::UserSpeech, true).await;
                }
            }

            SpeakEvent::Stopped {
                turn_id,
                char_end,
                text,
            } => {
                let Some(turn) = self.current.as_mut() else { return };
                if turn.id != turn_id {
                    debug!(target: "turn", turn_id, "stale utterance ack dropped");
                    return;
                }
                turn.spoken_chars = char_end;
                if !turn.assistant_text.is_empty() {
                    turn.assistant_text.push(' ');
                }
                turn.assistant_text.push_str(&text);
                PipelineMetrics::bump(&self.metrics.utterances_synthesized);
            }

            SpeakEvent::TurnAudioDone { turn_id } => {
                let Some(turn) = self.current.as_mut() else { return };
                if turn.id != turn_id {
                    return;
                }
                match turn.state {
                    TurnState::Speaking => self.complete_turn().await,
                    TurnState::Thinking => {
                        // The model produced nothing to say; retire without
                        // synthesis and without touching the context.
                        debug!(target: "turn", turn_id, "empty reply, retiring");
                        turn.state = TurnState::Done;
                        turn.finished_at = Some(Instant::now());
                        PipelineMetrics::bump(&self.metrics.turns_completed);
                        self.retire().await;
                    }
                    _ => {}
                }
            }

            SpeakEvent::Failed {
                turn_id,
                message,
                recoverable,
            } => {
                PipelineMetrics::bump(&self.metrics.tts_errors);
                let is_current = self.current.as_ref().map(|t| t.id) == Some(turn_id);
                if is_current {
                    let _ = self.interrupt_tx.send(Interrupt {
                        turn_id,
                        reason: InterruptReason::TurnAbort,
                    });
                    self.emit_error(turn_id, ErrorKind::Tts, &message, recoverable).await;
                    // Commit what the user actually heard before the crash.
                    if let Some(turn) = self.current.as_mut() {
                        self.context
                            .commit_turn(&turn.user_text, &turn.assistant_text);
                        turn.state = TurnState::Done;
                        turn.finished_at = Some(Instant::now());
                    }
                    PipelineMetrics::bump(&self.metrics.turns_aborted);
                    self.retire().await;
                } else if !recoverable {
                    self.emit_error(turn_id, ErrorKind::Tts, &message, recoverable).await;
                }
                if !recoverable {
                    self.outcome = Some(ControllerOutcome::Fatal);
                }
            }
        }
    }

    // ── interruption ────────────────────────────────────────────────

    async fn apply_interrupt(&mut self, turn_id: u64, reason: InterruptReason, rebroadcast: bool) {
        let Some(turn) = self.current.as_mut() else { return };
        if turn.id != turn_id || !turn.is_active() {
            return;
        }

        if rebroadcast {
            let _ = self.interrupt_tx.send(Interrupt { turn_id, reason });
        }

        match turn.state {
            TurnState::Listening | TurnState::Transcribing => {
                // Nothing generated yet; the turn just evaporates.
                debug!(target: "turn", turn_id, ?reason, "turn cancelled before thinking");
                turn.state = TurnState::Interrupted;
                turn.finished_at = Some(Instant::now());
                self.report.interrupted = true;
                PipelineMetrics::bump(&self.metrics.turns_interrupted);
                self.retire().await;
            }
            TurnState::Thinking | TurnState::Speaking => {
                info!(
                    target: "turn",
                    turn_id,
                    ?reason,
                    spoken_chars = turn.spoken_chars,
                    "turn interrupted"
                );
                turn.state = TurnState::Interrupted;
                turn.finished_at = Some(Instant::now());
                self.report.interrupted = true;
                PipelineMetrics::bump(&self.metrics.turns_interrupted);

                // Commit only what was actually heard. An empty spoken
                // prefix commits nothing at all.
                self.context
                    .commit_turn(&turn.user_text, &turn.assistant_text);
                self.retire().await;
            }
            TurnState::Interrupted | TurnState::Done => {}
        }
    }

    // ── turn lifecycle ──────────────────────────────────────────────

    fn start_turn(&mut self, id: u64) {
        debug!(target: "turn", turn_id = id, "turn started");
        self.current = Some(Turn::new(id));
        self.report = TurnReport {
            turn_id: id,
            ..TurnReport::default()
        };
        PipelineMetrics::bump(&self.metrics.turns_started);
        self.publish_status();
    }

    async fn complete_turn(&mut self) {
        let Some(turn) = self.current.as_mut() else { return };
        turn.state = TurnState::Done;
        turn.finished_at = Some(Instant::now());
        self.report.t_tts_done = Some(turn.created_at.elapsed());
        self.context
            .commit_turn(&turn.user_text, &turn.assistant_text);
        PipelineMetrics::bump(&self.metrics.turns_completed);
        debug!(
            target: "turn",
            turn_id = turn.id,
            user = %turn.user_text,
            assistant = %turn.assistant_text,
            "turn committed"
        );
        self.retire().await;
    }

    /// Drop the current turn, report it, and replay anything deferred.
    async fn retire(&mut self) {
        if let Some(turn) = self.current.take() {
            self.last_retired = self.last_retired.max(turn.id);
            self.sink.record_turn(&self.report);
        }
        self.publish_status();

        for frame in self.pending.drain(..) {
            self.replay.push_back(frame);
        }

        if self.draining && self.replay.is_empty() {
            self.finish_drain().await;
        }
    }

    async fn finish_drain(&mut self) {
        debug!(target: "turn", "drain complete");
        let _ = self
            .out_tx
            .send(Frame::System {
                kind: SystemKind::Drain,
            })
            .await;
        self.outcome = Some(ControllerOutcome::Drained);
    }

    fn buffer_pending(&mut self, frame: Frame) {
        if self.pending.len() >= PENDING_CAP {
            self.pending.remove(0);
        }
        self.pending.push(frame);
    }

    // ── helpers ─────────────────────────────────────────────────────

    fn publish_status(&self) {
        let status = match &self.current {
            Some(turn) => ControllerStatus {
                turn_id: turn.id,
                speaking: turn.state == TurnState::Speaking,
            },
            None => ControllerStatus::default(),
        };
        let _ = self.status_tx.send(status);
    }

    async fn emit_error(&mut self, turn_id: u64, kind: ErrorKind, message: &str, recoverable: bool) {
        let _ = self
            .out_tx
            .send(Frame::Error {
                meta: self.seq.next(turn_id),
                kind,
                message: message.to_string(),
                recoverable,
            })
            .await;
    }
}

/// System message, retained history, then the new user turn.
fn assemble_prompt(context: &ContextStore, user_text: &str) -> Vec<ChatMessage> {
    let mut messages = context.snapshot();
    messages.push(ChatMessage::user(user_text));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxloop_telemetry::NullSink;

    // Full pipeline behavior is covered by the integration tests; these
    // exercise controller-local helpers.

    #[test]
    fn prompt_is_system_history_then_user() {
        let mut context = ContextStore::new("sys", 4);
        context.commit_turn("q1", "a1");
        let prompt = assemble_prompt(&context, "q2");
        let texts: Vec<&str> = prompt.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["sys", "q1", "a1", "q2"]);
    }

    #[tokio::test]
    async fn stop_frame_ends_the_controller() {
        let (events_tx, events_rx) = mpsc::channel(8);
        let (_speak_tx, speak_rx) = mpsc::channel::<SpeakEvent>(8);
        let (interrupt_tx, interrupt_rx) = broadcast::channel(8);
        let (prompt_tx, _prompt_rx) = mpsc::channel(8);
        let (out_tx, _out_rx) = mpsc::channel(8);
        let (status_tx, _status_rx) = watch::channel(ControllerStatus::default());

        let controller = TurnController::new(
            events_rx,
            speak_rx,
            interrupt_rx,
            interrupt_tx,
            prompt_tx,
            out_tx,
            status_tx,
            FrameSequencer::new(),
            ContextStore::new("sys", 4),
            PipelineMetrics::new(),
            Arc::new(NullSink),
        );
        let handle = tokio::spawn(controller.run());

        events_tx
            .send(Frame::System {
                kind: SystemKind::Stop,
            })
            .await
            .unwrap();
        assert_eq!(handle.await.unwrap(), ControllerOutcome::Disconnected);
    }
}
