//! Error types for the voice agent pipeline.

/// Top-level error type for the voice loan-agent system.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// WebSocket transport error (client connection).
    #[error("transport error: {0}")]
    Transport(String),

    /// Speech-recognition backend error.
    #[error("ASR error: {0}")]
    Asr(String),

    /// Language model streaming error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Speech-synthesis backend error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Eligibility scoring error.
    #[error("scoring error: {0}")]
    Scoring(String),

    /// Application store error.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Pipeline coordination error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Whether the session can survive this error.
    ///
    /// Backend failures become non-fatal `error` events and the session
    /// keeps accepting input. Transport failures end the session.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Transport(_) | Self::Io(_))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AgentError>;
