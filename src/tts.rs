//! Speech synthesis backend seam.
//!
//! Synthesis is a single request/response call per sentence; the
//! dispatcher in [`crate::segment`] invokes it concurrently for
//! back-to-back sentences, so implementations must be `Sync`.

use crate::config::TtsConfig;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

/// A text-to-speech backend returning encoded audio bytes.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize one sentence to audio bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend call fails or times out.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

/// HTTP synthesis backend (Piper-style server: text in, WAV bytes out).
pub struct HttpSynthesizer {
    config: TtsConfig,
    client: reqwest::Client,
}

impl HttpSynthesizer {
    /// Create a new HTTP synthesizer from config.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &TtsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AgentError::Tts(format!("failed to build HTTP client: {e}")))?;
        info!("TTS configured: {} voice={}", config.api_url, config.voice);
        Ok(Self {
            config: config.clone(),
            client,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let body = serde_json::json!({
            "text": text,
            "voice": self.config.voice,
        });
        let response = self
            .client
            .post(&self.config.api_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Tts(format!("synthesis request failed: {e}")))?
            .error_for_status()
            .map_err(|e| AgentError::Tts(format!("synthesis returned error status: {e}")))?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AgentError::Tts(format!("failed to read synthesis body: {e}")))?;
        if bytes.is_empty() {
            return Err(AgentError::Tts("backend returned empty audio".to_owned()));
        }
        Ok(bytes.to_vec())
    }
}
