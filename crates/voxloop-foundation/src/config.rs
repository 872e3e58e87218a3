//! Environment-driven engine configuration.
//!
//! Every option has a default; anything present in the environment must
//! parse, otherwise startup fails with a `config` error (process exit 1).

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Compute device selection for the STT capability provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SttDevice {
    Auto,
    Cpu,
    Gpu,
}

impl FromStr for SttDevice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(SttDevice::Auto),
            "cpu" => Ok(SttDevice::Cpu),
            "gpu" => Ok(SttDevice::Gpu),
            other => Err(format!("unknown STT device {other:?} (expected auto|cpu|gpu)")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadSettings {
    /// Continuous activity required before entering speech.
    pub start_threshold_ms: u32,
    /// Continuous silence required before leaving speech.
    pub min_silence_ms: u32,
    /// Audio retained from before speech onset and prepended to the utterance.
    pub speech_pad_ms: u32,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            start_threshold_ms: 80,
            min_silence_ms: 200,
            speech_pad_ms: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttSettings {
    /// Pinned to 0.0 for deterministic transcription.
    pub temperature: f32,
    pub device: SttDevice,
}

impl Default for SttSettings {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            device: SttDevice::Auto,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Maximum non-system messages retained in the conversation context.
    pub context_max: usize,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 512,
            context_max: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsSettings {
    pub voice_id: Option<String>,
    pub sample_rate: u32,
    /// Child respawn budget within [`TtsSettings::restart_window`].
    pub max_restarts: u32,
    #[serde(skip)]
    pub restart_window: Duration,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            voice_id: None,
            sample_rate: 24_000,
            max_restarts: 3,
            restart_window: Duration::from_secs(30),
        }
    }
}

/// Full engine configuration, assembled from the environment at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub bind_addr: String,
    pub port: u16,
    pub capture_sample_rate: u32,
    pub vad: VadSettings,
    pub stt: SttSettings,
    pub llm: LlmSettings,
    pub tts: TtsSettings,
    pub system_prompt: String,
    pub log_dir: String,
}

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful voice assistant. Keep replies short and conversational.";

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8000,
            capture_sample_rate: 16_000,
            vad: VadSettings::default(),
            stt: SttSettings::default(),
            llm: LlmSettings::default(),
            tts: TtsSettings::default(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            log_dir: "logs".to_string(),
        }
    }
}

impl EngineConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, EngineError> {
        let mut cfg = Self::default();

        cfg.bind_addr = env_string("VOXLOOP_BIND_ADDR").unwrap_or(cfg.bind_addr);
        cfg.port = env_parse("PORT")?.unwrap_or(cfg.port);

        cfg.vad.min_silence_ms = env_parse("VAD_MIN_SILENCE_MS")?.unwrap_or(cfg.vad.min_silence_ms);
        cfg.vad.start_threshold_ms = env_parse("VAD_START_MS")?.unwrap_or(cfg.vad.start_threshold_ms);
        cfg.vad.speech_pad_ms = env_parse("VAD_PAD_MS")?.unwrap_or(cfg.vad.speech_pad_ms);

        cfg.llm.temperature = env_parse("LLM_TEMPERATURE")?.unwrap_or(cfg.llm.temperature);
        cfg.llm.max_tokens = env_parse("LLM_MAX_TOKENS")?.unwrap_or(cfg.llm.max_tokens);
        cfg.llm.context_max = env_parse("LLM_CONTEXT_MAX")?.unwrap_or(cfg.llm.context_max);

        cfg.tts.voice_id = env_string("TTS_VOICE_ID").or(cfg.tts.voice_id);
        cfg.tts.sample_rate = env_parse("TTS_SAMPLE_RATE")?.unwrap_or(cfg.tts.sample_rate);
        cfg.tts.max_restarts = env_parse("TTS_MAX_RESTARTS")?.unwrap_or(cfg.tts.max_restarts);

        cfg.stt.temperature = env_parse("STT_TEMPERATURE")?.unwrap_or(cfg.stt.temperature);
        cfg.stt.device = env_parse("STT_DEVICE")?.unwrap_or(cfg.stt.device);

        cfg.system_prompt = env_string("SYSTEM_PROMPT").unwrap_or(cfg.system_prompt);
        cfg.log_dir = env_string("VOXLOOP_LOG_DIR").unwrap_or(cfg.log_dir);

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.llm.context_max == 0 {
            return Err(EngineError::Config(
                "LLM_CONTEXT_MAX must be at least 1".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(EngineError::Config(format!(
                "LLM_TEMPERATURE {} outside [0.0, 2.0]",
                self.llm.temperature
            )));
        }
        if self.tts.sample_rate == 0 || self.capture_sample_rate == 0 {
            return Err(EngineError::Config("sample rates must be non-zero".to_string()));
        }
        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>, EngineError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| EngineError::Config(format!("invalid {key}={raw:?}: {e}"))),
        _ => Ok(None),
    }
}
