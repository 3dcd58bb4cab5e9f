//! Configuration types for the voice loan-agent pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the voice agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// HTTP/WebSocket server settings.
    pub server: ServerConfig,
    /// Speech-recognition backend settings.
    pub asr: AsrConfig,
    /// Language model settings.
    pub llm: LlmConfig,
    /// Speech-synthesis settings.
    pub tts: TtsConfig,
    /// Dialogue state machine settings (required fields, sanity floors).
    pub dialogue: DialogueConfig,
}

/// Server transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the server binds to, e.g. `0.0.0.0:8000`.
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_owned(),
        }
    }
}

/// Streaming speech-recognition configuration.
///
/// The default values target a Deepgram-style WebSocket endpoint, but any
/// backend speaking the same framing works.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    /// WebSocket URL of the recognition backend.
    pub url: String,
    /// API key sent as a bearer token (empty = no auth header).
    pub api_key: String,
    /// Input sample rate in Hz (PCM 16-bit mono expected from the client).
    pub sample_rate: u32,
    /// Audio encoding label forwarded to the backend.
    pub encoding: String,
    /// Whether the backend should emit interim (non-final) transcripts.
    pub interim_results: bool,
    /// Idle interval in ms after which a keep-alive is sent so the
    /// backend does not drop the connection for inactivity.
    pub keepalive_interval_ms: u64,
    /// Maximum recognizer reconnect attempts per session.
    pub max_reconnects: u32,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.deepgram.com/v1/listen".to_owned(),
            api_key: String::new(),
            sample_rate: 16_000,
            encoding: "linear16".to_owned(),
            interim_results: true,
            keepalive_interval_ms: 5_000,
            max_reconnects: 3,
        }
    }
}

/// Language model configuration (OpenAI-compatible streaming API).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible server (Ollama, vLLM, etc.).
    pub api_url: String,
    /// Model identifier.
    pub api_model: String,
    /// API key (empty = no auth header).
    pub api_key: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Nucleus sampling threshold.
    pub top_p: f64,
    /// Maximum tokens to generate per turn.
    pub max_tokens: usize,
    /// Number of most recent conversation turns sent with each request.
    pub max_history_turns: usize,
    /// Delimiter separating spoken text from the structured-data block
    /// in the model output.
    pub payload_delimiter: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:11434".to_owned(),
            api_model: "llama3.2".to_owned(),
            api_key: String::new(),
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 512,
            max_history_turns: 10,
            payload_delimiter: "|||JSON|||".to_owned(),
        }
    }
}

/// Speech-synthesis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// URL of the synthesis endpoint (text in, audio bytes out).
    pub api_url: String,
    /// Voice identifier passed to the backend.
    pub voice: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Maximum concurrent synthesis requests per response.
    pub max_concurrent: usize,
    /// Flush a sentence once the buffer exceeds this many characters
    /// even without terminal punctuation (bounds latency on run-on output).
    pub max_sentence_chars: usize,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:5002/api/tts".to_owned(),
            voice: "en_US-amy-medium".to_owned(),
            timeout_secs: 10,
            max_concurrent: 3,
            max_sentence_chars: 240,
        }
    }
}

/// Dialogue controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    /// Profile fields that must be present before the verification /
    /// eligibility gate opens.
    pub required_fields: Vec<String>,
    /// Sanity floor for monthly income before scoring is allowed.
    pub min_income: f64,
    /// Sanity floor for credit score before scoring is allowed.
    pub min_credit_score: u32,
    /// Sanity floor for the requested loan amount before scoring.
    pub min_loan_amount: f64,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            required_fields: vec![
                "name".to_owned(),
                "monthly_income".to_owned(),
                "credit_score".to_owned(),
                "loan_amount".to_owned(),
                "employment_type".to_owned(),
                "loan_purpose".to_owned(),
                "existing_emi".to_owned(),
                "marital_status".to_owned(),
            ],
            min_income: 1.0,
            min_credit_score: 300,
            min_loan_amount: 1.0,
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::AgentError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::AgentError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/loanvoice/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("loanvoice").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("loanvoice")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/loanvoice-config/config.toml")
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn default_required_fields_cover_full_set() {
        let config = DialogueConfig::default();
        assert_eq!(config.required_fields.len(), 8);
        assert!(config.required_fields.contains(&"monthly_income".to_owned()));
        assert!(config.required_fields.contains(&"marital_status".to_owned()));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AgentConfig::default();
        config.llm.api_model = "mistral".to_owned();
        config.asr.keepalive_interval_ms = 7_500;
        config.save_to_file(&path).unwrap();

        let loaded = AgentConfig::from_file(&path).unwrap();
        assert_eq!(loaded.llm.api_model, "mistral");
        assert_eq!(loaded.asr.keepalive_interval_ms, 7_500);
        assert_eq!(loaded.tts.max_concurrent, 3);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let toml_str = r#"
            [llm]
            api_model = "qwen3"
        "#;
        let config: AgentConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.llm.api_model, "qwen3");
        assert_eq!(config.llm.payload_delimiter, "|||JSON|||");
        assert_eq!(config.server.bind_addr, "0.0.0.0:8000");
    }
}
