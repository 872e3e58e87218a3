//! The newline-delimited JSON protocol between supervisor and worker.
//!
//! One request line elicits a response stream terminated by `eof`:
//! `started`, zero or more `audio_chunk`s, `stopped`, `eof`. Failures
//! surface as an `error` line. Raw PCM per chunk is capped so the base64
//! line stays well under a 64 KiB reader limit.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::TtsError;

/// Raw PCM bytes per `audio_chunk` payload.
pub const MAX_RAW_CHUNK_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// Text to synthesize. May be empty only for `ping` requests.
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    /// Liveness probe: elicits an immediate `eof` with no audio.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ping: bool,
}

impl WorkerRequest {
    pub fn speak(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn ping() -> Self {
        Self {
            ping: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    Started,
    AudioChunk {
        sample_rate: u32,
        /// Base64-encoded PCM16LE, at most [`MAX_RAW_CHUNK_BYTES`] decoded.
        data: String,
    },
    Stopped,
    Eof,
    Error {
        message: String,
    },
}

/// Split raw PCM into protocol-sized base64 chunks.
pub fn encode_audio_chunks(pcm: &[u8], sample_rate: u32) -> Vec<WorkerResponse> {
    pcm.chunks(MAX_RAW_CHUNK_BYTES)
        .map(|chunk| WorkerResponse::AudioChunk {
            sample_rate,
            data: BASE64.encode(chunk),
        })
        .collect()
}

pub fn decode_audio_chunk(data: &str) -> Result<Vec<u8>, TtsError> {
    BASE64
        .decode(data)
        .map_err(|e| TtsError::Protocol(format!("bad audio chunk encoding: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_compactly() {
        let req = WorkerRequest::speak("Hello.");
        assert_eq!(serde_json::to_string(&req).unwrap(), r#"{"text":"Hello."}"#);

        let ping = WorkerRequest::ping();
        assert_eq!(
            serde_json::to_string(&ping).unwrap(),
            r#"{"text":"","ping":true}"#
        );
    }

    #[test]
    fn request_accepts_optional_fields() {
        let req: WorkerRequest =
            serde_json::from_str(r#"{"text":"hi","voice_id":"af_sarah","speed":1.2}"#).unwrap();
        assert_eq!(req.voice_id.as_deref(), Some("af_sarah"));
        assert_eq!(req.speed, Some(1.2));
        assert!(!req.ping);
    }

    #[test]
    fn response_tags_round_trip() {
        for resp in [
            WorkerResponse::Started,
            WorkerResponse::Stopped,
            WorkerResponse::Eof,
            WorkerResponse::Error {
                message: "boom".into(),
            },
        ] {
            let line = serde_json::to_string(&resp).unwrap();
            let back: WorkerResponse = serde_json::from_str(&line).unwrap();
            assert_eq!(back, resp);
        }
        assert_eq!(
            serde_json::to_string(&WorkerResponse::Eof).unwrap(),
            r#"{"type":"eof"}"#
        );
    }

    #[test]
    fn chunking_respects_the_raw_cap() {
        let pcm = vec![7u8; MAX_RAW_CHUNK_BYTES * 2 + 100];
        let chunks = encode_audio_chunks(&pcm, 24_000);
        assert_eq!(chunks.len(), 3);

        let mut decoded = Vec::new();
        for chunk in &chunks {
            match chunk {
                WorkerResponse::AudioChunk { sample_rate, data } => {
                    assert_eq!(*sample_rate, 24_000);
                    let raw = decode_audio_chunk(data).unwrap();
                    assert!(raw.len() <= MAX_RAW_CHUNK_BYTES);
                    decoded.extend(raw);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(decoded, pcm);
    }

    #[test]
    fn empty_pcm_encodes_to_no_chunks() {
        assert!(encode_audio_chunks(&[], 24_000).is_empty());
    }

    #[test]
    fn bad_base64_is_a_protocol_error() {
        assert!(matches!(
            decode_audio_chunk("not base64!!!"),
            Err(TtsError::Protocol(_))
        ));
    }
}
