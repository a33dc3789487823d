//! Error types for the voice-agent orchestrator.

/// Top-level error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Speech-to-text connection or transcription error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Language model request or streaming error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Illegal turn-state transition (scheduler bug).
    #[error("illegal state transition: {0}")]
    State(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// Client transport error.
    #[error("transport error: {0}")]
    Transport(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AgentError>;
