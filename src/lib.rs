//! Wren: always-listening voice assistant pipeline core.
//!
//! A microphone stream is segmented into utterances by an energy-based
//! VAD, each utterance is transcribed, and a wake-word gated conversation
//! state machine composes prompts that are answered by a language model
//! and optionally spoken back.
//!
//! # Architecture
//!
//! Independent stages connected by bounded oldest-drop queues:
//! - **Frame assembly**: re-slices device buffers into fixed PCM frames
//! - **Segmentation**: hysteresis VAD with burst mode and an adaptive
//!   noise floor, emitting WAV-encoded utterance chunks
//! - **Transcription**: pre-ASR silence gate, then the external engine
//! - **Conversation**: suppression gate → state machine → prompt
//!   orchestration against the language model and TTS collaborators
//! - **Store**: append-only, optionally AES-256-GCM encrypted message log
//!   that doubles as the LLM context source
//!
//! The external engines (audio capture, ASR, LLM, TTS) are supplied by
//! the host through the traits in [`traits`].

pub mod audio;
pub mod clock;
pub mod config;
pub mod error;
pub mod fsm;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod segmenter;
pub mod store;
pub mod suppression;
pub mod traits;
pub mod transcriber;

pub use clock::{Clock, SystemClock};
pub use config::AssistantConfig;
pub use error::{AssistantError, Result};
pub use fsm::{ConversationFsm, ConversationMode, FsmEvent};
pub use pipeline::AssistantPipeline;
pub use store::{ChatMessage, ChatRole, ConversationStore};
