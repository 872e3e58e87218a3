//! The worker-side request loop.
//!
//! Runs inside the child process: reads one JSON request per stdin line,
//! writes the response stream to stdout, exits cleanly on stdin EOF. Kept
//! generic over the byte streams so tests can drive it over in-memory
//! pipes.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::protocol::{encode_audio_chunks, WorkerRequest, WorkerResponse};
use crate::synth::{SynthesisOptions, Synthesizer};

/// Request-field fallbacks supplied on the worker command line.
#[derive(Debug, Clone, Default)]
pub struct WorkerDefaults {
    pub voice_id: Option<String>,
    pub language: Option<String>,
    pub speed: Option<f32>,
}

impl WorkerDefaults {
    fn resolve(&self, req: &WorkerRequest) -> SynthesisOptions {
        SynthesisOptions {
            voice_id: req.voice_id.clone().or_else(|| self.voice_id.clone()),
            language: req.language.clone().or_else(|| self.language.clone()),
            speed: req.speed.or(self.speed).unwrap_or(1.0),
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(
    out: &mut W,
    resp: &WorkerResponse,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(resp)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    out.write_all(&line).await?;
    out.flush().await
}

/// Process requests until EOF on the input stream.
///
/// The model must already be loaded. One request at a time; parallelism is
/// the supervisor's business, not ours.
pub async fn run_worker<S, R, W>(
    mut synth: S,
    defaults: WorkerDefaults,
    input: R,
    mut output: W,
) -> std::io::Result<()>
where
    S: Synthesizer,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await? {
        let request: WorkerRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                warn!("invalid request line: {e}");
                write_line(
                    &mut output,
                    &WorkerResponse::Error {
                        message: format!("invalid JSON: {e}"),
                    },
                )
                .await?;
                continue;
            }
        };

        if request.ping {
            write_line(&mut output, &WorkerResponse::Eof).await?;
            continue;
        }

        if request.text.is_empty() {
            write_line(
                &mut output,
                &WorkerResponse::Error {
                    message: "request missing 'text' field".to_string(),
                },
            )
            .await?;
            continue;
        }

        let options = defaults.resolve(&request);
        debug!(chars = request.text.len(), "synthesizing");

        write_line(&mut output, &WorkerResponse::Started).await?;
        match synth.synthesize(&request.text, &options) {
            Ok(pcm) => {
                for chunk in encode_audio_chunks(&pcm, synth.sample_rate()) {
                    write_line(&mut output, &chunk).await?;
                }
                write_line(&mut output, &WorkerResponse::Stopped).await?;
            }
            Err(e) => {
                warn!("synthesis failed: {e}");
                write_line(
                    &mut output,
                    &WorkerResponse::Error {
                        message: e.to_string(),
                    },
                )
                .await?;
            }
        }
        write_line(&mut output, &WorkerResponse::Eof).await?;
    }

    debug!("stdin closed, worker exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{SynthError, TonePcmSynthesizer};
    use tokio::io::BufReader;

    struct BrokenSynth;

    impl Synthesizer for BrokenSynth {
        fn name(&self) -> &str {
            "broken"
        }
        fn load(&mut self) -> Result<(), SynthError> {
            Ok(())
        }
        fn sample_rate(&self) -> u32 {
            24_000
        }
        fn synthesize(&mut self, _: &str, _: &SynthesisOptions) -> Result<Vec<u8>, SynthError> {
            Err(SynthError::Synthesis("no voice today".into()))
        }
    }

    async fn drive(input: &str) -> Vec<WorkerResponse> {
        drive_with(TonePcmSynthesizer::new(24_000), input).await
    }

    async fn drive_with<S: Synthesizer>(synth: S, input: &str) -> Vec<WorkerResponse> {
        let mut output = Vec::new();
        run_worker(
            synth,
            WorkerDefaults::default(),
            BufReader::new(input.as_bytes()),
            &mut output,
        )
        .await
        .unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn request_yields_framed_stream() {
        let responses = drive("{\"text\":\"Hi.\"}\n").await;
        assert_eq!(responses.first(), Some(&WorkerResponse::Started));
        assert_eq!(responses.last(), Some(&WorkerResponse::Eof));
        assert!(responses.contains(&WorkerResponse::Stopped));
        assert!(responses
            .iter()
            .any(|r| matches!(r, WorkerResponse::AudioChunk { .. })));
    }

    #[tokio::test]
    async fn two_requests_two_streams() {
        let responses = drive("{\"text\":\"One.\"}\n{\"text\":\"Two.\"}\n").await;
        let eofs = responses
            .iter()
            .filter(|r| matches!(r, WorkerResponse::Eof))
            .count();
        assert_eq!(eofs, 2);
    }

    #[tokio::test]
    async fn invalid_json_reports_error_and_continues() {
        let responses = drive("not json\n{\"text\":\"Ok.\"}\n").await;
        assert!(matches!(responses[0], WorkerResponse::Error { .. }));
        assert_eq!(responses[1], WorkerResponse::Started);
    }

    #[tokio::test]
    async fn missing_text_is_an_error() {
        let responses = drive("{}\n").await;
        assert!(matches!(responses[0], WorkerResponse::Error { .. }));
        assert_eq!(responses.len(), 1);
    }

    #[tokio::test]
    async fn ping_elicits_bare_eof() {
        let responses = drive("{\"ping\":true}\n").await;
        assert_eq!(responses, vec![WorkerResponse::Eof]);
    }

    #[tokio::test]
    async fn synthesis_failure_is_framed_with_eof() {
        let responses = drive_with(BrokenSynth, "{\"text\":\"Hi.\"}\n").await;
        assert_eq!(responses[0], WorkerResponse::Started);
        assert!(matches!(responses[1], WorkerResponse::Error { .. }));
        assert_eq!(responses[2], WorkerResponse::Eof);
    }

    #[tokio::test]
    async fn eof_on_stdin_terminates_cleanly() {
        let responses = drive("").await;
        assert!(responses.is_empty());
    }
}
