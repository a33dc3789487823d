//! Configuration types for the voice-agent orchestrator.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Client transport settings.
    pub server: ServerConfig,
    /// Speech-to-text provider settings.
    pub stt: SttConfig,
    /// Language model provider settings.
    pub llm: LlmConfig,
    /// Text-to-speech provider settings.
    pub tts: TtsConfig,
    /// Turn-taking behavior settings.
    pub turn: TurnConfig,
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a tuning
    /// parameter is outside its allowed range.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&raw)
            .map_err(|e| AgentError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Read provider credentials from the environment when set.
    ///
    /// Environment variables win over file values so deployments can keep
    /// secrets out of config files.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("VOXLOOP_STT_API_KEY") {
            self.stt.api_key = key;
        }
        if let Ok(key) = std::env::var("VOXLOOP_LLM_API_KEY") {
            self.llm.api_key = key;
        }
        if let Ok(key) = std::env::var("VOXLOOP_TTS_API_KEY") {
            self.tts.api_key = key;
        }
    }

    /// Check that all tuning parameters are within their allowed ranges.
    ///
    /// # Errors
    ///
    /// Returns a config error naming the first out-of-range field.
    pub fn validate(&self) -> Result<()> {
        let t = &self.turn;
        if !(200..=1000).contains(&t.min_silence_debounce_ms) {
            return Err(AgentError::Config(format!(
                "min_silence_debounce_ms={} outside 200..=1000",
                t.min_silence_debounce_ms
            )));
        }
        if !(500..=3000).contains(&t.max_silence_debounce_ms) {
            return Err(AgentError::Config(format!(
                "max_silence_debounce_ms={} outside 500..=3000",
                t.max_silence_debounce_ms
            )));
        }
        if t.min_silence_debounce_ms > t.max_silence_debounce_ms {
            return Err(AgentError::Config(format!(
                "min_silence_debounce_ms={} exceeds max_silence_debounce_ms={}",
                t.min_silence_debounce_ms, t.max_silence_debounce_ms
            )));
        }
        if !(0.1..=0.5).contains(&t.cancellation_rate_threshold) {
            return Err(AgentError::Config(format!(
                "cancellation_rate_threshold={} outside 0.1..=0.5",
                t.cancellation_rate_threshold
            )));
        }
        Ok(())
    }
}

/// Client transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the WebSocket/health server.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Frontend origin, recorded for the surrounding transport's CORS setup.
    pub frontend_origin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8000,
            frontend_origin: "http://localhost:5173".to_owned(),
        }
    }
}

/// Speech-to-text provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// WebSocket URL of the streaming STT endpoint.
    pub endpoint: String,
    /// Bearer token for the provider.
    pub api_key: String,
    /// Input sample rate in Hz.
    pub sample_rate: u32,
    /// Silence before the provider emits an utterance-end event, in ms.
    pub utterance_end_ms: u32,
    /// Keepalive interval when no audio is flowing, in ms.
    pub keepalive_interval_ms: u64,
    /// Send-queue capacity in chunks.
    pub send_queue_capacity: usize,
    /// How long to wait for send-queue space before dropping a chunk, in ms.
    pub enqueue_timeout_ms: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://api.deepgram.com/v1/listen".to_owned(),
            api_key: String::new(),
            sample_rate: 16_000,
            utterance_end_ms: 1_000,
            keepalive_interval_ms: 5_000,
            send_queue_capacity: 100,
            enqueue_timeout_ms: 100,
        }
    }
}

/// Language model provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the chat-completions API (trailing `/v1` optional).
    pub api_url: String,
    /// Model identifier.
    pub model: String,
    /// Bearer token for the provider.
    pub api_key: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum output tokens per response.
    pub max_tokens: u32,
    /// Request a priority service tier from the provider.
    pub use_priority_tier: bool,
    /// Organization ID header value, when the provider uses one.
    pub organization_id: Option<String>,
    /// Project ID header value, when the provider uses one.
    pub project_id: Option<String>,
    /// Connect timeout in ms.
    pub connect_timeout_ms: u64,
    /// Total request timeout in ms.
    pub request_timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1".to_owned(),
            model: "gpt-4o-mini".to_owned(),
            api_key: String::new(),
            temperature: 0.7,
            max_tokens: 200,
            use_priority_tier: false,
            organization_id: None,
            project_id: None,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
        }
    }
}

/// Text-to-speech provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// URL of the streaming synthesis endpoint.
    pub endpoint: String,
    /// Bearer token for the provider.
    pub api_key: String,
    /// Voice identifier.
    pub voice_id: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.elevenlabs.io/v1/text-to-speech".to_owned(),
            api_key: String::new(),
            voice_id: "21m00Tcm4TlvDq8ikWAM".to_owned(),
        }
    }
}

/// Turn-taking behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Initial end-of-utterance silence dwell in ms.
    pub initial_silence_debounce_ms: u64,
    /// Lower bound for the adaptive silence dwell in ms.
    pub min_silence_debounce_ms: u64,
    /// Upper bound for the adaptive silence dwell in ms.
    pub max_silence_debounce_ms: u64,
    /// Cancellation rate above which the dwell is increased.
    pub cancellation_rate_threshold: f32,
    /// Whether the dwell adapts to the observed cancellation rate.
    pub adaptive_debounce_enabled: bool,
    /// Total time budget for one LLM response in ms.
    pub llm_timeout_ms: u64,
    /// Safety timeout waiting for the next sentence in the TTS queue, in ms.
    pub sentence_queue_timeout_ms: u64,
    /// Safety timeout waiting for the client playback acknowledgement, in ms.
    pub playback_timeout_ms: u64,
    /// Maximum buffered user audio in seconds.
    pub max_audio_buffer_secs: u32,
    /// Sample rate assumed for buffered user audio, in Hz.
    pub audio_sample_rate: u32,
    /// Recent-turn window for LLM prompts (0 = full session).
    pub history_max_turns: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            initial_silence_debounce_ms: 400,
            min_silence_debounce_ms: 400,
            max_silence_debounce_ms: 1_200,
            cancellation_rate_threshold: 0.30,
            adaptive_debounce_enabled: true,
            llm_timeout_ms: 15_000,
            sentence_queue_timeout_ms: 20_000,
            playback_timeout_ms: 15_000,
            max_audio_buffer_secs: 30,
            audio_sample_rate: 16_000,
            history_max_turns: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.turn.initial_silence_debounce_ms == 400);
        assert!(config.turn.cancellation_rate_threshold == 0.30);
    }

    #[test]
    fn min_debounce_out_of_range_rejected() {
        let mut config = OrchestratorConfig::default();
        config.turn.min_silence_debounce_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn max_debounce_out_of_range_rejected() {
        let mut config = OrchestratorConfig::default();
        config.turn.max_silence_debounce_ms = 5_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_debounce_bounds_rejected() {
        let mut config = OrchestratorConfig::default();
        config.turn.min_silence_debounce_ms = 900;
        config.turn.max_silence_debounce_ms = 600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        let mut config = OrchestratorConfig::default();
        config.turn.cancellation_rate_threshold = 0.05;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: OrchestratorConfig = toml::from_str(
            r#"
            [llm]
            model = "gpt-4o"

            [turn]
            max_silence_debounce_ms = 2000
            "#,
        )
        .unwrap();
        assert!(config.llm.model == "gpt-4o");
        assert!(config.turn.max_silence_debounce_ms == 2_000);
        assert!(config.turn.min_silence_debounce_ms == 400);
        assert!(config.stt.send_queue_capacity == 100);
    }
}
