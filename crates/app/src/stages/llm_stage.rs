//! The LLM stage: an assembled prompt in, a bounded stream of token
//! frames out, ending in `LlmDone`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use voxloop_foundation::ErrorKind;
use voxloop_frames::{ChatMessage, Frame, FrameSequencer, Interrupt};
use voxloop_llm::{GenerationParams, LanguageModel, TokenChunk};
use voxloop_telemetry::PipelineMetrics;

pub const FIRST_TOKEN_TIMEOUT: Duration = Duration::from_secs(3);
pub const TOTAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Token frames buffered ahead of the aggregator before the stage blocks.
pub const TOKEN_QUEUE_DEPTH: usize = 64;

pub struct LlmStage {
    prompt_rx: mpsc::Receiver<Frame>,
    token_tx: mpsc::Sender<Frame>,
    events_tx: mpsc::Sender<Frame>,
    interrupt_rx: broadcast::Receiver<Interrupt>,
    provider: Arc<dyn LanguageModel>,
    params: GenerationParams,
    seq: FrameSequencer,
    metrics: PipelineMetrics,
    first_token_timeout: Duration,
    total_timeout: Duration,
    cancelled_through: Option<u64>,
    interrupt_closed: bool,
}

impl LlmStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prompt_rx: mpsc::Receiver<Frame>,
        token_tx: mpsc::Sender<Frame>,
        events_tx: mpsc::Sender<Frame>,
        interrupt_rx: broadcast::Receiver<Interrupt>,
        provider: Arc<dyn LanguageModel>,
        params: GenerationParams,
        seq: FrameSequencer,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            prompt_rx,
            token_tx,
            events_tx,
            interrupt_rx,
            provider,
            params,
            seq,
            metrics,
            first_token_timeout: FIRST_TOKEN_TIMEOUT,
            total_timeout: TOTAL_TIMEOUT,
            cancelled_through: None,
            interrupt_closed: false,
        }
    }

    #[cfg(test)]
    pub fn with_timeouts(mut self, first_token: Duration, total: Duration) -> Self {
        self.first_token_timeout = first_token;
        self.total_timeout = total;
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
        info!(target: "llm", provider = self.provider.name(), "stage started");
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

                frame = self.prompt_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if let Frame::Prompt { meta, messages } = frame {
                        if self.is_cancelled(meta.turn_id) {
                            debug!(target: "llm", turn_id = meta.turn_id, "stale prompt dropped");
                            continue;
                        }
                        self.stream_reply(meta.turn_id, messages).await;
                    }
                }
            }
        }
        info!(target: "llm", "stage stopping");
    }

    async fn stream_reply(&mut self, turn_id: u64, messages: Vec<ChatMessage>) {
        debug!(target: "llm", turn_id, messages = messages.len(), "generation started");

        let mut stream = match self.provider.chat_stream(&messages, self.params).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(target: "llm", turn_id, "generation failed to start: {e}");
                self.report_error(turn_id, e.to_string()).await;
                return;
            }
        };

        let started = Instant::now();
        let mut first_token_seen = false;

        loop {
            let budget = if first_token_seen {
                self.total_timeout.saturating_sub(started.elapsed())
            } else {
                self.first_token_timeout
            };
            if budget.is_zero() {
                self.report_timeout(turn_id, started.elapsed()).await;
                return;
            }

            let chunk = tokio::select! {
                biased;

                interrupt = self.interrupt_rx.recv(), if !self.interrupt_closed => {
                    match interrupt {
                        Ok(signal) => {
                            self.note_interrupt(signal.turn_id);
                            if signal.turn_id >= turn_id {
                                // Dropping the stream stops the producer
                                // within one generation step.
                                debug!(target: "llm", turn_id, "generation cancelled");
                                return;
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

                chunk = tokio::time::timeout(budget, stream.next()) => chunk,
            };

            match chunk {
                Err(_) => {
                    self.report_timeout(turn_id, started.elapsed()).await;
                    return;
                }
                Ok(None) => {
                    // Producer went away without a Done marker; close the
                    // turn's stream regardless.
                    warn!(target: "llm", turn_id, "token stream ended abruptly");
                    self.finish_stream(turn_id).await;
                    return;
                }
                Ok(Some(TokenChunk::Delta(delta))) => {
                    if !first_token_seen {
                        first_token_seen = true;
                        // One-time timing signal for the turn report.
                        let _ = self
                            .events_tx
                            .send(Frame::LlmToken {
                                meta: self.seq.next(turn_id),
                                delta: String::new(),
                            })
                            .await;
                    }
                    let frame = Frame::LlmToken {
                        meta: self.seq.next(turn_id),
                        delta,
                    };
                    if !self.forward_token(turn_id, frame).await {
                        return;
                    }
                }
                Ok(Some(TokenChunk::Done(full))) => {
                    debug!(target: "llm", turn_id, chars = full.len(), "generation complete");
                    self.finish_stream(turn_id).await;
                    return;
                }
            }
        }
    }

    /// Send one token downstream, honoring backpressure but staying
    /// responsive to interrupts. Returns false when the turn is over.
    async fn forward_token(&mut self, turn_id: u64, frame: Frame) -> bool {
        loop {
            tokio::select! {
                biased;

                interrupt = self.interrupt_rx.recv(), if !self.interrupt_closed => {
                    match interrupt {
                        Ok(signal) => {
                            self.note_interrupt(signal.turn_id);
                            if signal.turn_id >= turn_id {
                                return false;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => self.interrupt_closed = true,
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }

                sent = self.token_tx.send(frame.clone()) => {
                    return sent.is_ok();
                }
            }
        }
    }

    async fn finish_stream(&mut self, turn_id: u64) {
        let done = Frame::LlmDone {
            meta: self.seq.next(turn_id),
        };
        let _ = self.token_tx.send(done).await;
    }

    async fn report_error(&mut self, turn_id: u64, message: String) {
        PipelineMetrics::bump(&self.metrics.llm_errors);
        let _ = self
            .events_tx
            .send(Frame::Error {
                meta: self.seq.next(turn_id),
                kind: ErrorKind::Llm,
                message,
                recoverable: true,
            })
            .await;
    }

    async fn report_timeout(&mut self, turn_id: u64, elapsed: Duration) {
        warn!(target: "llm", turn_id, ?elapsed, "generation timed out");
        self.report_error(turn_id, format!("generation timed out after {elapsed:?}"))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxloop_llm::ScriptedLlm;

    struct Harness {
        prompt_tx: mpsc::Sender<Frame>,
        token_rx: mpsc::Receiver<Frame>,
        events_rx: mpsc::Receiver<Frame>,
        interrupt_tx: broadcast::Sender<Interrupt>,
        seq: FrameSequencer,
        handle: tokio::task::JoinHandle<()>,
    }

    fn spawn_stage(provider: ScriptedLlm) -> Harness {
        let (prompt_tx, prompt_rx) = mpsc::channel(8);
        let (token_tx, token_rx) = mpsc::channel(TOKEN_QUEUE_DEPTH);
        let (events_tx, events_rx) = mpsc::channel(8);
        let (interrupt_tx, interrupt_rx) = broadcast::channel(8);
        let seq = FrameSequencer::new();
        let stage = LlmStage::new(
            prompt_rx,
            token_tx,
            events_tx,
            interrupt_rx,
            Arc::new(provider),
            GenerationParams::default(),
            seq.clone(),
            PipelineMetrics::new(),
        );
        let handle = tokio::spawn(stage.run());
        Harness {
            prompt_tx,
            token_rx,
            events_rx,
            interrupt_tx,
            seq,
            handle,
        }
    }

    fn prompt(seq: &FrameSequencer, turn_id: u64, user: &str) -> Frame {
        Frame::Prompt {
            meta: seq.next(turn_id),
            messages: vec![ChatMessage::system("sys"), ChatMessage::user(user)],
        }
    }

    async fn collect_turn(rx: &mut mpsc::Receiver<Frame>) -> (String, bool) {
        let mut text = String::new();
        let mut done = false;
        while let Some(frame) = rx.recv().await {
            match frame {
                Frame::LlmToken { delta, .. } => text.push_str(&delta),
                Frame::LlmDone { .. } => {
                    done = true;
                    break;
                }
                _ => {}
            }
        }
        (text, done)
    }

    #[tokio::test]
    async fn prompt_streams_tokens_then_done() {
        let mut h = spawn_stage(ScriptedLlm::new().with_rule("two plus two", "Four."));
        h.prompt_tx
            .send(prompt(&h.seq, 1, "what is two plus two"))
            .await
            .unwrap();
        drop(h.prompt_tx);

        let (text, done) = collect_turn(&mut h.token_rx).await;
        assert_eq!(text, "Four.");
        assert!(done);
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn empty_reply_still_closes_the_stream() {
        let mut h = spawn_stage(ScriptedLlm::new().with_default_reply(""));
        h.prompt_tx.send(prompt(&h.seq, 1, "hm")).await.unwrap();
        drop(h.prompt_tx);

        let (text, done) = collect_turn(&mut h.token_rx).await;
        assert!(text.is_empty());
        assert!(done);
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn provider_failure_reports_llm_error() {
        let provider = ScriptedLlm::new();
        provider.fail_next();
        let mut h = spawn_stage(provider);
        h.prompt_tx.send(prompt(&h.seq, 2, "x")).await.unwrap();
        drop(h.prompt_tx);

        let frame = h.events_rx.recv().await.unwrap();
        assert!(matches!(
            frame,
            Frame::Error {
                kind: ErrorKind::Llm,
                recoverable: true,
                ..
            }
        ));
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn interrupt_stops_the_stream_mid_turn() {
        let provider = ScriptedLlm::new()
            .with_default_reply("a long reply streamed slowly to leave room for cancellation")
            .with_delta_chars(4)
            .with_delta_delay(Duration::from_millis(10));
        let mut h = spawn_stage(provider);
        h.prompt_tx.send(prompt(&h.seq, 1, "go")).await.unwrap();

        // Wait for the first token, then interrupt.
        let first = h.token_rx.recv().await.unwrap();
        assert!(matches!(first, Frame::LlmToken { .. }));
        h.interrupt_tx
            .send(Interrupt {
                turn_id: 1,
                reason: voxloop_frames::InterruptReason::UserSpeech,
            })
            .unwrap();
        drop(h.prompt_tx);

        // The stream stops without an LlmDone for the cancelled turn.
        let mut saw_done = false;
        while let Some(frame) = h.token_rx.recv().await {
            if matches!(frame, Frame::LlmDone { .. }) {
                saw_done = true;
            }
        }
        assert!(!saw_done);
        h.handle.await.unwrap();
    }
}
