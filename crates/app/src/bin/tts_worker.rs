//! The synthesis worker process.
//!
//! Loads one synthesizer at startup, then serves line-delimited JSON
//! requests on stdin until EOF. Stdout carries protocol only; all logging
//! goes to stderr.

use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use voxloop_tts::{run_worker, SynthError, Synthesizer, TonePcmSynthesizer, WorkerDefaults};

struct WorkerArgs {
    sample_rate: u32,
    voice_id: Option<String>,
    language: Option<String>,
    speed: Option<f32>,
    debug: bool,
}

fn parse_args() -> Result<WorkerArgs, String> {
    let mut parsed = WorkerArgs {
        sample_rate: 24_000,
        voice_id: None,
        language: None,
        speed: None,
        debug: false,
    };

    let mut args = std::env::args().skip(1);
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--sample-rate" => {
                let value = args.next().ok_or("--sample-rate needs a value")?;
                parsed.sample_rate = value
                    .parse()
                    .map_err(|e| format!("bad --sample-rate {value:?}: {e}"))?;
            }
            "--voice-id" => {
                parsed.voice_id = Some(args.next().ok_or("--voice-id needs a value")?);
            }
            "--language" => {
                parsed.language = Some(args.next().ok_or("--language needs a value")?);
            }
            "--speed" => {
                let value = args.next().ok_or("--speed needs a value")?;
                parsed.speed = Some(
                    value
                        .parse()
                        .map_err(|e| format!("bad --speed {value:?}: {e}"))?,
                );
            }
            "--debug" => parsed.debug = true,
            other => return Err(format!("unknown flag {other:?}")),
        }
    }
    Ok(parsed)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("voxloop-tts-worker: {e}");
            std::process::exit(1);
        }
    };

    // Stdout is the protocol stream; logs must stay on stderr.
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut synth = TonePcmSynthesizer::new(args.sample_rate);
    if let Err(e) = synth.load() {
        tracing::error!("synthesizer load failed: {e}");
        let code = match e {
            SynthError::ModelLoad(_) => 2,
            _ => 1,
        };
        std::process::exit(code);
    }
    tracing::info!(
        engine = synth.name(),
        sample_rate = args.sample_rate,
        "worker ready"
    );

    let defaults = WorkerDefaults {
        voice_id: args.voice_id,
        language: args.language,
        speed: args.speed,
    };
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    if let Err(e) = run_worker(synth, defaults, stdin, stdout).await {
        tracing::error!("worker I/O failed: {e}");
        std::process::exit(1);
    }
}
