//! Sentence aggregation between the token stream and synthesis.
//!
//! Synthesis quality and latency both want short, well-punctuated chunks:
//! emitting too early fragments prosody, emitting too late wastes
//! first-audio latency.

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use voxloop_frames::{Frame, FrameSequencer, Interrupt};

/// Characters that end an utterance when followed by whitespace.
const TERMINAL_PUNCTUATION: [char; 5] = ['.', '!', '?', ';', ':'];

pub const DEFAULT_MAX_CHARS: usize = 180;

/// Pure chunking state: deltas in, utterance chunks out.
///
/// Tracks the cumulative character offset each emitted chunk ends at, which
/// downstream acknowledgements reference for interruption truncation.
pub struct UtteranceBuffer {
    buf: String,
    emitted_chars: usize,
    max_chars: usize,
}

impl UtteranceBuffer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            buf: String::new(),
            emitted_chars: 0,
            max_chars: max_chars.max(1),
        }
    }

    fn ends_terminal(&self) -> bool {
        self.buf
            .chars()
            .last()
            .map(|c| TERMINAL_PUNCTUATION.contains(&c))
            .unwrap_or(false)
    }

    fn take_chunk(&mut self) -> (String, usize) {
        let chunk = std::mem::take(&mut self.buf);
        self.emitted_chars += chunk.chars().count() + 1;
        (chunk, self.emitted_chars)
    }

    /// Feed one delta; returns zero or more completed chunks.
    pub fn push_delta(&mut self, delta: &str) -> Vec<(String, usize)> {
        let mut out = Vec::new();
        for ch in delta.chars() {
            if ch.is_whitespace() {
                if self.ends_terminal() {
                    out.push(self.take_chunk());
                    continue;
                }
                if self.buf.is_empty() {
                    continue;
                }
            }
            self.buf.push(ch);

            if self.buf.chars().count() > self.max_chars {
                if let Some(chunk) = self.split_overgrown() {
                    out.push(chunk);
                }
            }
        }
        out
    }

    /// Split an overgrown buffer at the latest comma or whitespace.
    fn split_overgrown(&mut self) -> Option<(String, usize)> {
        let split_at = self
            .buf
            .char_indices()
            .filter(|(_, c)| *c == ',' || c.is_whitespace())
            .map(|(i, c)| i + c.len_utf8())
            .last()?;
        let tail = self.buf.split_off(split_at);
        let head = std::mem::replace(&mut self.buf, tail.trim_start().to_string());
        let head = head.trim_end().to_string();
        if head.is_empty() {
            return None;
        }
        self.emitted_chars += head.chars().count() + 1;
        Some((head, self.emitted_chars))
    }

    /// End of stream: emit whatever remains.
    pub fn flush(&mut self) -> Option<(String, usize)> {
        if self.buf.trim().is_empty() {
            self.buf.clear();
            return None;
        }
        let (chunk, end) = self.take_chunk();
        Some((chunk.trim_end().to_string(), end))
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.emitted_chars = 0;
    }

    pub fn emitted_chars(&self) -> usize {
        self.emitted_chars
    }
}

/// Stage worker: buffers `LlmToken` frames into `Utterance` frames.
pub struct SentenceAggregator {
    token_rx: mpsc::Receiver<Frame>,
    utterance_tx: mpsc::Sender<Frame>,
    interrupt_rx: broadcast::Receiver<Interrupt>,
    seq: FrameSequencer,
    buffer: UtteranceBuffer,
    current_turn: u64,
    cancelled_through: Option<u64>,
    interrupt_closed: bool,
}

impl SentenceAggregator {
    pub fn new(
        token_rx: mpsc::Receiver<Frame>,
        utterance_tx: mpsc::Sender<Frame>,
        interrupt_rx: broadcast::Receiver<Interrupt>,
        seq: FrameSequencer,
        max_chars: usize,
    ) -> Self {
        Self {
            token_rx,
            utterance_tx,
            interrupt_rx,
            seq,
            buffer: UtteranceBuffer::new(max_chars),
            current_turn: 0,
            cancelled_through: None,
            interrupt_closed: false,
        }
    }

    fn is_cancelled(&self, turn_id: u64) -> bool {
        self.cancelled_through
            .map(|through| turn_id <= through)
            .unwrap_or(false)
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                interrupt = self.interrupt_rx.recv(), if !self.interrupt_closed => {
                    match interrupt {
                        Ok(signal) => {
                            if signal.turn_id >= self.current_turn {
                                self.buffer.clear();
                            }
                            self.cancelled_through = Some(
                                self.cancelled_through
                                    .map_or(signal.turn_id, |t| t.max(signal.turn_id)),
                            );
                            debug!(target: "aggregator", turn_id = signal.turn_id, "cleared on interrupt");
                        }
                        Err(broadcast::error::RecvError::Closed) => self.interrupt_closed = true,
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }

                frame = self.token_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if !self.handle_frame(frame).await {
                        break;
                    }
                }
            }
        }
        debug!(target: "aggregator", "aggregator stopping");
    }

    /// Returns false when the downstream channel is gone.
    async fn handle_frame(&mut self, frame: Frame) -> bool {
        match frame {
            Frame::LlmToken { meta, delta } => {
                if self.is_cancelled(meta.turn_id) {
                    return true;
                }
                if meta.turn_id != self.current_turn {
                    self.buffer.clear();
                    self.current_turn = meta.turn_id;
                }
                for (text, char_end) in self.buffer.push_delta(&delta) {
                    trace!(target: "aggregator", turn_id = meta.turn_id, chars = char_end, "utterance");
                    let out = Frame::Utterance {
                        meta: self.seq.next(meta.turn_id),
                        text,
                        char_end,
                    };
                    if self.utterance_tx.send(out).await.is_err() {
                        return false;
                    }
                }
                true
            }
            Frame::LlmDone { meta } => {
                if self.is_cancelled(meta.turn_id) {
                    return true;
                }
                if meta.turn_id == self.current_turn {
                    if let Some((text, char_end)) = self.buffer.flush() {
                        let out = Frame::Utterance {
                            meta: self.seq.next(meta.turn_id),
                            text,
                            char_end,
                        };
                        if self.utterance_tx.send(out).await.is_err() {
                            return false;
                        }
                    }
                    self.buffer.clear();
                }
                // Forward the end-of-stream marker so the synthesis stage
                // can report turn completion.
                self.utterance_tx
                    .send(Frame::LlmDone { meta })
                    .await
                    .is_ok()
            }
            other => {
                trace!(target: "aggregator", tag = other.tag(), "ignoring frame");
                true
            }
        }
    }
}
