//! Configuration types for the assistant pipeline.
//!
//! The core performs no file or flag parsing of its own — a host builds an
//! [`AssistantConfig`] (for example via [`AssistantConfig::from_toml_str`])
//! and passes it in at startup.

use crate::error::{AssistantError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the assistant core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Speech segmentation settings.
    pub segmenter: SegmenterConfig,
    /// Conversation host settings (wake word, silence timers, channel sizing).
    pub host: HostConfig,
    /// Conversation store and LLM context settings.
    pub context: ContextConfig,
    /// Transcription heuristics.
    pub stt: SttConfig,
}

impl AssistantConfig {
    /// Parse a configuration from a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not parse or fails validation.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)
            .map_err(|e| AssistantError::Config(format!("invalid TOML config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let seg = &self.segmenter;
        if seg.sample_rate == 0 {
            return Err(AssistantError::Config("sample_rate must be positive".into()));
        }
        if seg.channels == 0 {
            return Err(AssistantError::Config("channels must be positive".into()));
        }
        if seg.frame_ms == 0 {
            return Err(AssistantError::Config("frame_ms must be positive".into()));
        }
        if seg.frame_bytes() == 0 {
            return Err(AssistantError::Config(
                "frame_ms too small for the configured sample rate".into(),
            ));
        }
        if seg.max_segment_ms < seg.min_segment_ms {
            return Err(AssistantError::Config(
                "max_segment_ms must be >= min_segment_ms".into(),
            ));
        }
        if self.host.audio_queue_capacity == 0 || self.host.transcription_queue_capacity == 0 {
            return Err(AssistantError::Config(
                "queue capacities must be positive".into(),
            ));
        }
        if self.host.ticker_interval_ms == 0 {
            return Err(AssistantError::Config(
                "ticker_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Speech segmentation configuration.
///
/// The segmenter consumes fixed-size PCM frames of `frame_ms` duration and
/// classifies them with enter/exit hysteresis. Thresholds apply to features
/// of normalized samples in \[-1, 1\].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Input sample rate in Hz.
    pub sample_rate: u32,
    /// Number of input channels (1 = mono).
    pub channels: u16,
    /// Frame duration in ms.
    pub frame_ms: u32,

    /// RMS threshold to enter Speech.
    ///
    /// Typical values:
    ///   - 0.01: sensitive (picks up quiet speech and some noise)
    ///   - 0.02: normal sensitivity (default)
    ///   - 0.05: low sensitivity (only loud/close speech)
    pub enter_rms: f32,
    /// Active-sample ratio threshold to enter Speech.
    pub enter_active_ratio: f32,
    /// Consecutive qualifying frames required to enter Speech.
    pub enter_consecutive: u32,

    /// RMS threshold to exit Speech (should sit below `enter_rms`).
    pub exit_rms: f32,
    /// Active-sample ratio threshold to exit Speech.
    pub exit_active_ratio: f32,
    /// Consecutive quiet frames required to exit Speech.
    pub exit_consecutive: u32,

    /// Audio prepended to a detected segment from the pre-roll ring, in ms.
    pub prepend_padding_ms: u32,
    /// Zero-filled audio appended to an emitted segment, in ms.
    pub append_padding_ms: u32,
    /// Segments shorter than this are discarded (except max-length flushes).
    pub min_segment_ms: u32,
    /// Accumulated speech beyond this is flushed immediately.
    pub max_segment_ms: u32,

    /// Absolute amplitude above which a sample counts as active.
    pub active_sample_abs_threshold: f32,

    /// RMS that triggers burst entry from a single frame. 0 disables.
    pub burst_enter_rms: f32,
    /// Peak amplitude that triggers burst entry from a single frame. 0 disables.
    pub burst_peak_abs_threshold: f32,
    /// Hold window after burst entry during which no exit applies, in ms.
    pub burst_window_ms: u32,
    /// Minimum duration for a burst-entered segment to be emitted, in ms.
    pub burst_min_segment_ms: u32,
    /// Consecutive quiet frames that end a burst-entered segment.
    pub burst_quiet_consecutive: u32,

    /// Whether the noise-floor EMA raises the effective thresholds.
    pub use_adaptive_thresholds: bool,
    /// EMA coefficient for the noise floor, clamped to \[0.0001, 1\].
    pub noise_floor_alpha: f32,
    /// Effective enter threshold is `max(enter_rms, noise_floor * this)`.
    pub noise_floor_enter_multiplier: f32,
    /// Effective exit threshold is `max(exit_rms, noise_floor * this)`.
    pub noise_floor_exit_multiplier: f32,

    /// Whether to emit periodic segmenter metrics lines.
    pub enable_metrics: bool,
    /// Interval between metrics lines, in ms.
    pub metrics_interval_ms: u32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            frame_ms: 20,
            enter_rms: 0.02,
            enter_active_ratio: 0.1,
            enter_consecutive: 3,
            exit_rms: 0.012,
            exit_active_ratio: 0.05,
            exit_consecutive: 25,
            prepend_padding_ms: 200,
            append_padding_ms: 200,
            min_segment_ms: 300,
            max_segment_ms: 15_000,
            active_sample_abs_threshold: 0.01,
            burst_enter_rms: 0.08,
            burst_peak_abs_threshold: 0.3,
            burst_window_ms: 600,
            burst_min_segment_ms: 150,
            burst_quiet_consecutive: 10,
            use_adaptive_thresholds: true,
            noise_floor_alpha: 0.05,
            noise_floor_enter_multiplier: 3.0,
            noise_floor_exit_multiplier: 2.0,
            enable_metrics: false,
            metrics_interval_ms: 5_000,
        }
    }
}

impl SegmenterConfig {
    /// Size of one PCM frame in bytes (16-bit LE samples).
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        (self.frame_ms as usize * self.sample_rate as usize * self.channels as usize * 2) / 1000
    }

    /// Number of whole frames covering `ms` milliseconds.
    #[must_use]
    pub fn frames_for_ms(&self, ms: u32) -> u32 {
        if self.frame_ms == 0 {
            return 0;
        }
        ms / self.frame_ms
    }
}

/// Conversation host configuration: FSM timers and channel sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Wake word, matched case-insensitively as a substring of a meaningful
    /// utterance. Empty admits any meaningful utterance from Quiescent.
    pub wake_word: String,
    /// Silence after the last meaningful utterance before a prompt is
    /// composed, in seconds.
    pub processing_silence_seconds: f64,
    /// Silence since entering Listening before the conversation lapses back
    /// to Quiescent, in seconds.
    pub end_silence_seconds: f64,
    /// Capacity of the segmenter → transcriber queue.
    pub audio_queue_capacity: usize,
    /// Capacity of the transcriber → FSM queue.
    pub transcription_queue_capacity: usize,
    /// Interval between FSM ticks, in ms.
    pub ticker_interval_ms: u64,
    /// Grace period after Processing/Speaking ends during which
    /// transcriptions are still suppressed, in ms.
    pub suppression_tail_grace_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            wake_word: "wren".to_owned(),
            processing_silence_seconds: 8.0,
            end_silence_seconds: 60.0,
            audio_queue_capacity: 16,
            transcription_queue_capacity: 64,
            ticker_interval_ms: 200,
            suppression_tail_grace_ms: 300,
        }
    }
}

/// Conversation store and LLM context configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Number of stored messages provided as LLM context.
    pub last_n: usize,
    /// Storage root. `None` resolves to the OS cache directory.
    pub storage_root: Option<PathBuf>,
    /// Passphrase for the conversation log envelope. Empty stores plaintext.
    pub encryption_key: String,
    /// System prompt prepended to every structured prompt.
    pub system_prompt: String,
    /// Regex patterns removed from LLM replies before persisting/speaking.
    pub reply_filters: Vec<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            last_n: 6,
            storage_root: None,
            encryption_key: "replace-me-before-deployment".to_owned(),
            system_prompt: "You are a helpful voice assistant. Keep replies short and speakable."
                .to_owned(),
            reply_filters: Vec::new(),
        }
    }
}

/// Transcription heuristics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Segments whose RMS falls below this bypass ASR entirely.
    pub silence_rms_threshold: f32,
    /// Minimum whitespace-separated words for a transcription to count as
    /// meaningful.
    pub min_words: usize,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            silence_rms_threshold: 0.015,
            min_words: 1,
        }
    }
}
