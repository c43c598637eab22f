//! Error types for the assistant pipeline.

/// Top-level error type for the voice assistant core.
#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    /// Audio capture or frame assembly error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech segmentation error.
    #[error("segmenter error: {0}")]
    Segmenter(String),

    /// Speech-to-text transcription error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Language model inference error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Conversation store error (append, envelope, tail read).
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

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AssistantError>;
