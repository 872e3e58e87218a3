//! Shared harness for end-to-end session tests: an in-memory client on one
//! side of a duplex pipe, the full pipeline on the other, and scripted
//! capability providers with a real synthesis worker process.

// Each test binary uses a different slice of the harness.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use voxloop_app::runtime::{run_session, SessionProviders};
use voxloop_app::transport::codec::{read_wire_frame, write_wire_frame, WireFrame, WireKind};
use voxloop_app::transport::control::{ControlMessage, ErrorMessage};
use voxloop_app::turn::ControllerOutcome;
use voxloop_foundation::{EngineConfig, EngineError};
use voxloop_frames::{pcm, ChatMessage};
use voxloop_llm::{GenerationParams, LanguageModel, LlmError, ScriptedLlm, TokenStream};
use voxloop_stt::ScriptedStt;
use voxloop_telemetry::{NullSink, PipelineMetrics};
use voxloop_tts::SupervisorConfig;

pub const WAIT: Duration = Duration::from_secs(10);

/// Chat provider that records every prompt it is asked to answer.
pub struct RecordingLlm {
    inner: ScriptedLlm,
    calls: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl RecordingLlm {
    pub fn new(inner: ScriptedLlm) -> (Self, Arc<Mutex<Vec<Vec<ChatMessage>>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                inner,
                calls: calls.clone(),
            },
            calls,
        )
    }
}

#[async_trait]
impl LanguageModel for RecordingLlm {
    fn name(&self) -> &str {
        "recording"
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        params: GenerationParams,
    ) -> Result<TokenStream, LlmError> {
        self.calls.lock().unwrap().push(messages.to_vec());
        self.inner.chat_stream(messages, params).await
    }
}

/// The real worker binary, built alongside the test.
pub fn worker_supervisor_config() -> SupervisorConfig {
    SupervisorConfig::new(env!("CARGO_BIN_EXE_voxloop-tts-worker")).with_args(vec![
        "--sample-rate".to_string(),
        "24000".to_string(),
    ])
}

pub fn providers(stt: ScriptedStt, llm: impl LanguageModel + 'static) -> SessionProviders {
    SessionProviders {
        stt: Box::new(stt),
        llm: Arc::new(llm),
        tts: worker_supervisor_config(),
    }
}

pub fn providers_with_tts(
    stt: ScriptedStt,
    llm: impl LanguageModel + 'static,
    tts: SupervisorConfig,
) -> SessionProviders {
    SessionProviders {
        stt: Box::new(stt),
        llm: Arc::new(llm),
        tts,
    }
}

/// Something the client observed from the server.
#[derive(Debug)]
pub enum ClientEvent {
    Audio(Vec<u8>),
    Control(ControlMessage),
    Error(ErrorMessage),
    System(ControlMessage),
    Closed,
}

pub struct TestClient {
    pub reader: ReadHalf<DuplexStream>,
    pub writer: WriteHalf<DuplexStream>,
    pub session: JoinHandle<Result<ControllerOutcome, EngineError>>,
}

/// Start a full session against an in-memory stream and complete the
/// client side of the handshake.
pub async fn start_session(config: EngineConfig, providers: SessionProviders) -> TestClient {
    let (client, server) = tokio::io::duplex(1 << 20);

    let session = tokio::spawn(async move {
        run_session(
            server,
            &config,
            providers,
            PipelineMetrics::new(),
            Arc::new(NullSink),
        )
        .await
    });

    let (mut reader, mut writer) = tokio::io::split(client);

    let hello = tokio::time::timeout(WAIT, read_wire_frame(&mut reader))
        .await
        .expect("hello in time")
        .expect("hello frame");
    assert_eq!(hello.kind, WireKind::System);
    let msg: ControlMessage = serde_json::from_slice(&hello.payload).unwrap();
    let (sr_in, sr_out) = match msg {
        ControlMessage::Hello { sr_in, sr_out, .. } => (sr_in, sr_out),
        other => panic!("expected hello, got {other:?}"),
    };

    let accept = serde_json::to_vec(&ControlMessage::Accept { sr_in, sr_out }).unwrap();
    write_wire_frame(&mut writer, &WireFrame::new(WireKind::System, accept))
        .await
        .unwrap();

    TestClient {
        reader,
        writer,
        session,
    }
}

impl TestClient {
    // Writes tolerate a server that is already tearing down; assertions
    // live on the read side.
    pub async fn send_audio(&mut self, samples: &[i16]) {
        let payload = pcm::samples_to_bytes(samples);
        let _ = write_wire_frame(
            &mut self.writer,
            &WireFrame::new(WireKind::AudioClient, payload),
        )
        .await;
    }

    pub async fn send_control(&mut self, msg: &ControlMessage) {
        let payload = serde_json::to_vec(msg).unwrap();
        let kind = match msg {
            ControlMessage::Hello { .. } | ControlMessage::Accept { .. } | ControlMessage::Drain => {
                WireKind::System
            }
            _ => WireKind::Control,
        };
        let _ = write_wire_frame(&mut self.writer, &WireFrame::new(kind, payload)).await;
    }

    pub async fn send_raw(&mut self, frame: &WireFrame) {
        let _ = write_wire_frame(&mut self.writer, frame).await;
    }

    /// Next server frame, decoded. `Closed` on EOF.
    pub async fn next_event(&mut self) -> ClientEvent {
        match tokio::time::timeout(WAIT, read_wire_frame(&mut self.reader)).await {
            Err(_) => panic!("timed out waiting for a server frame"),
            Ok(Err(_)) => ClientEvent::Closed,
            Ok(Ok(frame)) => match frame.kind {
                WireKind::AudioServer => ClientEvent::Audio(frame.payload),
                WireKind::Control => {
                    ClientEvent::Control(serde_json::from_slice(&frame.payload).unwrap())
                }
                WireKind::Error => {
                    ClientEvent::Error(serde_json::from_slice(&frame.payload).unwrap())
                }
                WireKind::System => {
                    ClientEvent::System(serde_json::from_slice(&frame.payload).unwrap())
                }
                WireKind::AudioClient => panic!("server echoed client audio"),
            },
        }
    }

    /// Read until the bot finishes one utterance stream; returns the PCM
    /// byte total and any error frames seen on the way.
    pub async fn collect_bot_reply(&mut self) -> BotReply {
        let mut reply = BotReply::default();
        loop {
            match self.next_event().await {
                ClientEvent::Audio(pcm) => {
                    reply.audio_frames += 1;
                    reply.audio_bytes += pcm.len();
                    assert_eq!(pcm.len() % 2, 0, "odd PCM16 payload");
                }
                ClientEvent::Control(ControlMessage::TtsStarted { turn_id }) => {
                    reply.started_turns.push(turn_id);
                }
                ClientEvent::Control(ControlMessage::TtsStopped { turn_id }) => {
                    reply.stopped_turns.push(turn_id);
                    return reply;
                }
                ClientEvent::Error(err) => reply.errors.push(err),
                ClientEvent::Closed => panic!("session closed mid-reply"),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    pub async fn close(mut self) -> Result<ControllerOutcome, EngineError> {
        let _ = self.writer.shutdown().await;
        drop(self.writer);
        drop(self.reader);
        tokio::time::timeout(WAIT, self.session)
            .await
            .expect("session end in time")
            .expect("session task")
    }
}

#[derive(Debug, Default)]
pub struct BotReply {
    pub audio_frames: usize,
    pub audio_bytes: usize,
    pub started_turns: Vec<u64>,
    pub stopped_turns: Vec<u64>,
    pub errors: Vec<ErrorMessage>,
}

/// A loud tone: detected as speech by the energy gate.
pub fn speech(ms: u32) -> Vec<i16> {
    let n = (16_000 * ms as usize) / 1000;
    (0..n)
        .map(|i| {
            let phase = 2.0 * std::f32::consts::PI * i as f32 / 32.0;
            (phase.sin() * 12_000.0) as i16
        })
        .collect()
}

pub fn silence(ms: u32) -> Vec<i16> {
    vec![0i16; (16_000 * ms as usize) / 1000]
}

/// Drive one user turn end to end: speech burst, hold-off silence.
pub async fn speak_turn(client: &mut TestClient, speech_ms: u32) {
    client.send_audio(&speech(speech_ms)).await;
    client.send_audio(&silence(400)).await;
}
