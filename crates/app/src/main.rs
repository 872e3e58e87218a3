//! The voxloop server binary.
//!
//! Binds the transport, then serves one pipeline session per connection.
//! The shipped capability providers are the deterministic scripted ones;
//! real recognizers and chat models plug in behind the same traits.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use voxloop_app::runtime::{run_session, SessionProviders};
use voxloop_foundation::{shutdown_pair, EngineConfig, EngineError};
use voxloop_llm::ScriptedLlm;
use voxloop_stt::ScriptedStt;
use voxloop_telemetry::{LogSink, MetricsSink, PipelineMetrics};
use voxloop_tts::SupervisorConfig;

fn init_logging(log_dir: &str) -> anyhow::Result<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "voxloop.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(non_blocking_file))
        .init();

    // Keep the appender guard alive for the life of the process.
    std::mem::forget(guard);
    Ok(())
}

/// Locate the synthesis worker binary next to this executable.
fn worker_config(config: &EngineConfig) -> Result<SupervisorConfig, EngineError> {
    let exe = std::env::current_exe()?;
    let worker = exe
        .parent()
        .map(|dir| dir.join("voxloop-tts-worker"))
        .filter(|p| p.exists())
        .ok_or_else(|| {
            EngineError::ModelLoad("voxloop-tts-worker binary not found next to server".to_string())
        })?;

    let mut args = vec![
        "--sample-rate".to_string(),
        config.tts.sample_rate.to_string(),
    ];
    if let Some(voice) = &config.tts.voice_id {
        args.push("--voice-id".to_string());
        args.push(voice.clone());
    }

    Ok(SupervisorConfig::new(worker.to_string_lossy().to_string())
        .with_args(args)
        .with_restart_budget(config.tts.max_restarts, config.tts.restart_window))
}

fn build_providers(tts: &SupervisorConfig) -> SessionProviders {
    SessionProviders {
        stt: Box::new(ScriptedStt::new().with_default_text("hello")),
        llm: Arc::new(
            ScriptedLlm::new()
                .with_rule("two plus two", "Four.")
                .with_rule("hello", "Hello there. How can I help?")
                .with_default_reply("I heard you."),
        ),
        tts: tts.clone(),
    }
}

async fn serve() -> Result<(), EngineError> {
    let config = EngineConfig::from_env()?;

    if let Err(e) = init_logging(&config.log_dir) {
        return Err(EngineError::Config(format!("logging setup failed: {e}")));
    }
    tracing::info!(port = config.port, "starting voxloop");

    let tts_config = worker_config(&config)?;

    let addr = format!("{}:{}", config.bind_addr, config.port);
    let listener = TcpListener::bind(&addr).await.map_err(EngineError::Bind)?;
    tracing::info!(%addr, "transport listening");

    let metrics = PipelineMetrics::new();
    let sink: Arc<dyn MetricsSink> = Arc::new(LogSink);

    let (shutdown_handle, shutdown_token) = shutdown_pair();
    shutdown_handle.install_ctrl_c();
    let mut shutdown = shutdown_token;

    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                tracing::info!("shutdown requested");
                break;
            }
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("accept failed: {e}");
                        continue;
                    }
                };
                tracing::info!(%peer, "session connected");
                let config = config.clone();
                let providers = build_providers(&tts_config);
                let metrics = metrics.clone();
                let sink = sink.clone();
                tokio::spawn(async move {
                    match run_session(socket, &config, providers, metrics, sink).await {
                        Ok(outcome) => tracing::info!(%peer, ?outcome, "session closed"),
                        Err(e) => tracing::warn!(%peer, "session failed: {e}"),
                    }
                });
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = serve().await {
        eprintln!("voxloop: {e}");
        std::process::exit(e.exit_code());
    }
}
