//! Per-session pipeline assembly and teardown.
//!
//! One call wires every stage to its queues, runs the session to
//! completion, then stops the stages in reverse topological order with a
//! drain deadline per stage: a stage is only waited on after everything
//! downstream of it has drained.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use voxloop_foundation::{EngineConfig, EngineError};
use voxloop_frames::{Frame, FrameSequencer, Interrupt};
use voxloop_llm::{GenerationParams, LanguageModel};
use voxloop_stt::SpeechToText;
use voxloop_telemetry::{MetricsSink, PipelineMetrics};
use voxloop_tts::{SupervisorConfig, TtsSupervisor};
use voxloop_vad::{EnergyVad, VadConfig};

use crate::stages::llm_stage::TOKEN_QUEUE_DEPTH;
use crate::stages::tts_stage::AUDIO_OUT_DEPTH;
use crate::stages::{LlmStage, SttStage, TtsStage, VadGate};
use crate::transport::session::{SessionIo, SessionParams, TransportReader, TransportWriter};
use crate::turn::aggregator::DEFAULT_MAX_CHARS;
use crate::turn::{ContextStore, ControllerOutcome, ControllerStatus, SentenceAggregator, TurnController};

/// Per-stage drain allowance during graceful teardown.
const STAGE_DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// Allowance for the whole pipeline after an abrupt disconnect.
const ABRUPT_CLOSE_DEADLINE: Duration = Duration::from_millis(250);

/// Capability providers for one session.
pub struct SessionProviders {
    pub stt: Box<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: SupervisorConfig,
}

/// Run one session over an established byte stream. Returns when the
/// session ends; the stream is dropped on the way out.
pub async fn run_session<S>(
    stream: S,
    config: &EngineConfig,
    mut providers: SessionProviders,
    metrics: PipelineMetrics,
    sink: Arc<dyn MetricsSink>,
) -> Result<ControllerOutcome, EngineError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut stream = stream;
    let params = SessionIo::handshake(
        &mut stream,
        SessionParams {
            capture_rate: config.capture_sample_rate,
            playback_rate: config.tts.sample_rate,
        },
    )
    .await?;
    info!(
        target: "runtime",
        capture = params.capture_rate,
        playback = params.playback_rate,
        "session negotiated"
    );

    providers
        .stt
        .load()
        .await
        .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

    let seq = FrameSequencer::new();
    let (read_half, write_half) = tokio::io::split(stream);

    // Queues. Audio and token queues are bounded for backpressure; the
    // rest are sized for bursts, not capacity.
    let (audio_tx, audio_rx) = mpsc::channel::<Frame>(256);
    let (events_tx, events_rx) = mpsc::channel::<Frame>(256);
    let (speech_tx, speech_rx) = mpsc::channel::<Frame>(8);
    let (prompt_tx, prompt_rx) = mpsc::channel::<Frame>(8);
    let (token_tx, token_rx) = mpsc::channel::<Frame>(TOKEN_QUEUE_DEPTH);
    let (utterance_tx, utterance_rx) = mpsc::channel::<Frame>(16);
    let (speak_tx, speak_rx) = mpsc::channel(32);
    let (out_tx, out_rx) = mpsc::channel::<Frame>(AUDIO_OUT_DEPTH);
    let (interrupt_tx, _) = broadcast::channel::<Interrupt>(16);
    let (status_tx, status_rx) = watch::channel(ControllerStatus::default());

    let reader = TransportReader::new(
        read_half,
        audio_tx,
        events_tx.clone(),
        out_tx.clone(),
        seq.clone(),
        params,
        metrics.clone(),
    );
    let writer = TransportWriter::new(write_half, out_rx, metrics.clone());

    let vad_config = VadConfig {
        start_threshold_ms: config.vad.start_threshold_ms,
        min_silence_ms: config.vad.min_silence_ms,
        speech_pad_ms: config.vad.speech_pad_ms,
        sample_rate_hz: config.capture_sample_rate,
        ..VadConfig::default()
    };
    let gate = VadGate::new(
        audio_rx,
        events_tx.clone(),
        speech_tx,
        interrupt_tx.clone(),
        status_rx,
        Box::new(EnergyVad::new(vad_config.clone())),
        vad_config.pad_samples(),
        seq.clone(),
        metrics.clone(),
    );

    let stt = SttStage::new(
        speech_rx,
        events_tx.clone(),
        interrupt_tx.subscribe(),
        providers.stt,
        seq.clone(),
    );

    let llm = LlmStage::new(
        prompt_rx,
        token_tx,
        events_tx.clone(),
        interrupt_tx.subscribe(),
        providers.llm,
        GenerationParams {
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
        },
        seq.clone(),
        metrics.clone(),
    );

    let aggregator = SentenceAggregator::new(
        token_rx,
        utterance_tx,
        interrupt_tx.subscribe(),
        seq.clone(),
        DEFAULT_MAX_CHARS,
    );

    let tts = TtsStage::new(
        utterance_rx,
        out_tx.clone(),
        speak_tx,
        interrupt_tx.subscribe(),
        TtsSupervisor::new(providers.tts),
        config.tts.voice_id.clone(),
        seq.clone(),
        metrics.clone(),
    );

    let controller = TurnController::new(
        events_rx,
        speak_rx,
        interrupt_tx.subscribe(),
        interrupt_tx.clone(),
        prompt_tx,
        out_tx,
        status_tx,
        seq,
        ContextStore::new(&config.system_prompt, config.llm.context_max),
        metrics,
        sink,
    );

    // Runtime-held senders are all moved into workers above; dropping a
    // worker closes its downstream queues and the shutdown cascades.
    drop(events_tx);
    drop(interrupt_tx);

    let reader_handle = tokio::spawn(reader.run());
    let gate_handle = tokio::spawn(gate.run());
    let stt_handle = tokio::spawn(stt.run());
    let llm_handle = tokio::spawn(llm.run());
    let aggregator_handle = tokio::spawn(aggregator.run());
    let tts_handle = tokio::spawn(tts.run());
    let writer_handle = tokio::spawn(writer.run());

    let outcome = controller.run().await;
    info!(target: "runtime", ?outcome, "session ending");

    // Quiesce the source; upstream queue closures then cascade through
    // the pipeline while the sink-first waits below observe the drain.
    reader_handle.abort();
    let _ = reader_handle.await;

    let stages: [(&str, JoinHandle<()>); 6] = [
        ("writer", writer_handle),
        ("tts", tts_handle),
        ("aggregator", aggregator_handle),
        ("llm", llm_handle),
        ("stt", stt_handle),
        ("vad", gate_handle),
    ];

    let deadline = match outcome {
        ControllerOutcome::Drained => STAGE_DRAIN_DEADLINE,
        _ => ABRUPT_CLOSE_DEADLINE,
    };
    for (name, mut handle) in stages {
        match tokio::time::timeout(deadline, &mut handle).await {
            Ok(_) => debug!(target: "runtime", stage = name, "stage drained"),
            Err(_) => {
                warn!(target: "runtime", stage = name, "stage missed drain deadline, aborting");
                handle.abort();
                let _ = handle.await;
            }
        }
    }

    Ok(outcome)
}
