//! Collaborator contracts for the external engines.
//!
//! The core owns segmentation, conversation state and persistence; audio
//! capture, ASR, language modeling and speech synthesis are supplied by the
//! host through these traits. Any compatible implementation is acceptable.

use crate::error::Result;
use crate::store::ChatMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Produces raw audio byte buffers in the configured PCM format
/// (16-bit LE, interleaved, at the configured sample rate and channels).
///
/// Buffers may be any size; the frame assembler re-slices them. Returning
/// `Ok(None)` ends the stream and gracefully completes the pipeline.
#[async_trait]
pub trait AudioSource: Send {
    /// Next buffer of raw PCM bytes, or `None` when the source is exhausted.
    async fn next_buffer(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Speech-to-text engine.
///
/// Initialization is the implementation's concern and must be at-most-once;
/// a missing model is a fatal startup error, not something to retry here.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe a self-contained WAV stream to text.
    async fn transcribe(&self, wav: &[u8]) -> Result<String>;
}

/// A single message inside a structured prompt.
#[derive(Debug, Clone)]
pub struct PromptMessage {
    /// Message role (`user`, `assistant`, `system`).
    pub role: String,
    /// Message text.
    pub content: String,
    /// When the message was originally recorded.
    pub timestamp_utc: DateTime<Utc>,
}

impl From<&ChatMessage> for PromptMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: message.role.as_str().to_owned(),
            content: message.content.clone(),
            timestamp_utc: message.timestamp_utc,
        }
    }
}

/// The fully assembled prompt handed to the language model.
#[derive(Debug, Clone)]
pub struct StructuredPrompt {
    /// System prompt from configuration.
    pub system_prompt: String,
    /// Recent conversation context, oldest first.
    pub context: Vec<PromptMessage>,
    /// The user's composed utterance for this turn.
    pub user: PromptMessage,
    /// Time the prompt was assembled.
    pub now_utc: DateTime<Utc>,
}

/// Language model backend.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate a reply for the structured prompt. Implementations honor
    /// `cancel` at their own await points.
    async fn get_response(
        &self,
        prompt: &StructuredPrompt,
        cancel: &CancellationToken,
    ) -> Result<String>;
}

/// Text-to-speech backend. May be a no-op on platforms without audio out.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Speak `text` on the default output device, returning once playback
    /// has completed.
    async fn speak_default(&self, text: &str, cancel: &CancellationToken) -> Result<()>;
}

/// Supplies recent conversation history for prompt assembly.
///
/// [`crate::store::ConversationStore`] implements this over its tail read.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// The last `n` stored messages relevant to `prompt`, oldest first.
    async fn get_context(&self, prompt: &str, n: usize) -> Result<Vec<ChatMessage>>;
}
