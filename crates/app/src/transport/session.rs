//! Session handshake and the transport reader/writer workers.
//!
//! The reader decodes client frames into pipeline frames; the writer
//! encodes pipeline frames back onto the wire. Both are generic over the
//! byte stream so tests can drive them through in-memory duplex pipes.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use voxloop_foundation::{EngineError, ErrorKind};
use voxloop_frames::{pcm, Frame, FrameSequencer, SystemKind};
use voxloop_telemetry::PipelineMetrics;

use super::codec::{read_wire_frame, write_wire_frame, CodecError, WireFrame, WireKind};
use super::control::{ControlMessage, ErrorMessage};

/// Rates fixed by the handshake for the rest of the session.
#[derive(Debug, Clone, Copy)]
pub struct SessionParams {
    pub capture_rate: u32,
    pub playback_rate: u32,
}

pub const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(5);

/// Capture audio tolerated in the reader's overflow buffer before the
/// oldest blocks start getting dropped.
const OVERFLOW_BUDGET_MS: u64 = 5_000;

/// Marker type grouping the session I/O entry points.
pub struct SessionIo;

impl SessionIo {
    /// Server side of the connection handshake: announce capabilities,
    /// require a matching `accept` within the deadline.
    pub async fn handshake<S>(
        stream: &mut S,
        params: SessionParams,
    ) -> Result<SessionParams, EngineError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let hello = ControlMessage::Hello {
            sr_in: params.capture_rate,
            sr_out: params.playback_rate,
            codec: "pcm16".to_string(),
        };
        let payload = serde_json::to_vec(&hello)
            .map_err(|e| EngineError::Protocol(format!("hello serialization: {e}")))?;
        write_wire_frame(stream, &WireFrame::new(WireKind::System, payload))
            .await
            .map_err(|e| EngineError::Protocol(e.to_string()))?;

        let reply = tokio::time::timeout(HANDSHAKE_DEADLINE, read_wire_frame(stream))
            .await
            .map_err(|_| EngineError::Protocol("handshake timed out".to_string()))?
            .map_err(|e| EngineError::Protocol(e.to_string()))?;

        if reply.kind != WireKind::System {
            return Err(EngineError::Protocol(format!(
                "expected system accept, got {:?}",
                reply.kind
            )));
        }
        let msg: ControlMessage = serde_json::from_slice(&reply.payload)
            .map_err(|e| EngineError::Protocol(format!("bad accept payload: {e}")))?;
        match msg {
            ControlMessage::Accept { sr_in, sr_out } => {
                if sr_in != params.capture_rate || sr_out != params.playback_rate {
                    // Codec mismatch is fatal per the transport contract.
                    return Err(EngineError::Protocol(format!(
                        "codec mismatch: client {sr_in}/{sr_out}, server {}/{}",
                        params.capture_rate, params.playback_rate
                    )));
                }
                Ok(params)
            }
            other => Err(EngineError::Protocol(format!(
                "expected accept, got {other:?}"
            ))),
        }
    }
}

/// Decodes client frames; runs until disconnect or protocol violation.
pub struct TransportReader<R> {
    reader: R,
    audio_tx: mpsc::Sender<Frame>,
    events_tx: mpsc::Sender<Frame>,
    out_tx: mpsc::Sender<Frame>,
    seq: FrameSequencer,
    params: SessionParams,
    metrics: PipelineMetrics,
    overflow: VecDeque<Frame>,
    overflow_ms: u64,
    stream_pos_ms: u64,
}

impl<R> TransportReader<R>
where
    R: AsyncRead + Unpin,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reader: R,
        audio_tx: mpsc::Sender<Frame>,
        events_tx: mpsc::Sender<Frame>,
        out_tx: mpsc::Sender<Frame>,
        seq: FrameSequencer,
        params: SessionParams,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            reader,
            audio_tx,
            events_tx,
            out_tx,
            seq,
            params,
            metrics,
            overflow: VecDeque::new(),
            overflow_ms: 0,
            stream_pos_ms: 0,
        }
    }

    pub async fn run(mut self) {
        loop {
            let wire = match read_wire_frame(&mut self.reader).await {
                Ok(wire) => wire,
                Err(CodecError::Closed) => {
                    debug!(target: "transport", "client disconnected");
                    break;
                }
                Err(e) => {
                    warn!(target: "transport", "protocol violation: {e}");
                    let _ = self
                        .out_tx
                        .send(Frame::Error {
                            meta: self.seq.next(0),
                            kind: ErrorKind::Protocol,
                            message: e.to_string(),
                            recoverable: false,
                        })
                        .await;
                    break;
                }
            };

            match wire.kind {
                WireKind::AudioClient => self.handle_audio(wire.payload).await,
                WireKind::Control | WireKind::System => {
                    if !self.handle_control(wire).await {
                        break;
                    }
                }
                WireKind::AudioServer | WireKind::Error => {
                    warn!(target: "transport", "client sent server-only frame");
                    let _ = self
                        .out_tx
                        .send(Frame::Error {
                            meta: self.seq.next(0),
                            kind: ErrorKind::Protocol,
                            message: "client sent a server-only frame kind".to_string(),
                            recoverable: false,
                        })
                        .await;
                    break;
                }
            }
        }

        // Controller treats Stop as end-of-session.
        let _ = self.events_tx.send(Frame::System { kind: SystemKind::Stop }).await;
    }

    async fn handle_audio(&mut self, payload: Vec<u8>) {
        PipelineMetrics::bump(&self.metrics.audio_in_frames);
        let block_ms = pcm::byte_len_to_ms(payload.len(), self.params.capture_rate);
        let frame = Frame::AudioIn {
            meta: self.seq.next(0),
            pcm: payload,
            sample_rate: self.params.capture_rate,
            channels: 1,
            timestamp_ms: self.stream_pos_ms,
        };
        self.stream_pos_ms += block_ms;

        // Flush previously buffered blocks before the new one.
        while let Some(buffered) = self.overflow.pop_front() {
            let ms = audio_frame_ms(&buffered, self.params.capture_rate);
            match self.audio_tx.try_send(buffered) {
                Ok(()) => self.overflow_ms = self.overflow_ms.saturating_sub(ms),
                Err(mpsc::error::TrySendError::Full(frame)) => {
                    self.overflow.push_front(frame);
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }

        if self.overflow.is_empty() {
            match self.audio_tx.try_send(frame) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(frame)) => {
                    self.overflow.push_back(frame);
                    self.overflow_ms += block_ms;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        } else {
            self.overflow.push_back(frame);
            self.overflow_ms += block_ms;
        }

        // Saturated past the budget: drop oldest capture audio, never
        // anything downstream of it.
        while self.overflow_ms > OVERFLOW_BUDGET_MS {
            if let Some(dropped) = self.overflow.pop_front() {
                let ms = audio_frame_ms(&dropped, self.params.capture_rate);
                self.overflow_ms = self.overflow_ms.saturating_sub(ms);
                PipelineMetrics::bump(&self.metrics.audio_in_dropped);
            } else {
                self.overflow_ms = 0;
            }
        }
    }

    /// Returns false when the session must close.
    async fn handle_control(&mut self, wire: WireFrame) -> bool {
        let msg: ControlMessage = match serde_json::from_slice(&wire.payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(target: "transport", "malformed control message: {e}");
                let _ = self
                    .out_tx
                    .send(Frame::Error {
                        meta: self.seq.next(0),
                        kind: ErrorKind::Protocol,
                        message: format!("malformed control message: {e}"),
                        recoverable: false,
                    })
                    .await;
                return false;
            }
        };

        match msg {
            ControlMessage::Drain => {
                debug!(target: "transport", "client requested drain");
                let _ = self
                    .events_tx
                    .send(Frame::System { kind: SystemKind::Drain })
                    .await;
                true
            }
            ControlMessage::Interrupt { .. } => {
                // The controller resolves this to the active turn.
                let _ = self
                    .events_tx
                    .send(Frame::Interrupt {
                        meta: self.seq.next(0),
                        signal: voxloop_frames::Interrupt {
                            turn_id: 0,
                            reason: voxloop_frames::InterruptReason::Client,
                        },
                    })
                    .await;
                true
            }
            other => {
                warn!(target: "transport", "unexpected control message {other:?}");
                let _ = self
                    .out_tx
                    .send(Frame::Error {
                        meta: self.seq.next(0),
                        kind: ErrorKind::Protocol,
                        message: "unexpected control message".to_string(),
                        recoverable: false,
                    })
                    .await;
                false
            }
        }
    }
}

fn audio_frame_ms(frame: &Frame, fallback_rate: u32) -> u64 {
    match frame {
        Frame::AudioIn {
            pcm, sample_rate, ..
        } => pcm::byte_len_to_ms(pcm.len(), *sample_rate),
        _ => pcm::byte_len_to_ms(0, fallback_rate),
    }
}

/// Encodes pipeline frames onto the wire; runs until the channel closes or
/// the socket errors.
pub struct TransportWriter<W> {
    writer: W,
    out_rx: mpsc::Receiver<Frame>,
    metrics: PipelineMetrics,
}

impl<W> TransportWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W, out_rx: mpsc::Receiver<Frame>, metrics: PipelineMetrics) -> Self {
        Self {
            writer,
            out_rx,
            metrics,
        }
    }

    pub async fn run(mut self) {
        while let Some(frame) = self.out_rx.recv().await {
            let wire = match encode_out_frame(&frame) {
                Some(wire) => wire,
                None => continue,
            };
            if let Frame::AudioOut { .. } = frame {
                PipelineMetrics::bump(&self.metrics.audio_out_frames);
            }
            if let Err(e) = write_wire_frame(&mut self.writer, &wire).await {
                debug!(target: "transport", "writer stopping: {e}");
                break;
            }
        }
    }
}

fn encode_out_frame(frame: &Frame) -> Option<WireFrame> {
    match frame {
        Frame::AudioOut { pcm, .. } => Some(WireFrame::new(WireKind::AudioServer, pcm.clone())),
        Frame::TtsStarted { meta } => control_wire(&ControlMessage::TtsStarted {
            turn_id: meta.turn_id,
        }),
        Frame::TtsStopped { meta } => control_wire(&ControlMessage::TtsStopped {
            turn_id: meta.turn_id,
        }),
        Frame::Error {
            kind,
            message,
            recoverable,
            ..
        } => {
            let payload = serde_json::to_vec(&ErrorMessage {
                kind: *kind,
                message: message.clone(),
                recoverable: *recoverable,
            })
            .ok()?;
            Some(WireFrame::new(WireKind::Error, payload))
        }
        Frame::System { kind } => {
            let msg = match kind {
                SystemKind::Drain => ControlMessage::Drain,
                // Start/Stop are internal lifecycle markers.
                _ => return None,
            };
            let payload = serde_json::to_vec(&msg).ok()?;
            Some(WireFrame::new(WireKind::System, payload))
        }
        _ => None,
    }
}

fn control_wire(msg: &ControlMessage) -> Option<WireFrame> {
    let payload = serde_json::to_vec(msg).ok()?;
    Some(WireFrame::new(WireKind::Control, payload))
}
