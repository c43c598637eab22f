//! Message types passed between pipeline stages.

use chrono::{DateTime, Utc};

/// Why the segmenter ended a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentEndReason {
    /// Classical exit: enough consecutive quiet frames.
    Vad,
    /// Burst exit: quiet-frame count after a burst entry.
    Burst,
    /// Forced flush at the maximum segment length.
    Max,
}

impl SegmentEndReason {
    /// Short label used in metrics lines.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vad => "vad",
            Self::Burst => "burst",
            Self::Max => "max",
        }
    }
}

/// A complete speech segment encoded as WAV, ready for transcription.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Strictly increasing sequence number within the process.
    pub sequence: u64,
    /// When the segment was emitted.
    pub timestamp_utc: DateTime<Utc>,
    /// Duration of the captured speech (excluding appended padding), in ms.
    pub duration_ms: u32,
    /// Number of PCM frames in the segment (excluding appended padding).
    pub frame_count: u32,
    /// Self-contained, seekable WAV stream.
    pub wav: Vec<u8>,
    /// Why the segment ended.
    pub end_reason: SegmentEndReason,
}

/// A transcription produced from one [`AudioChunk`].
#[derive(Debug, Clone)]
pub struct TranscriptionItem {
    /// Sequence number of the source chunk.
    pub sequence: u64,
    /// Capture timestamp of the source chunk.
    pub timestamp_utc: DateTime<Utc>,
    /// Transcribed text. Blank when the pre-ASR gate bypassed the engine.
    pub text: String,
    /// Whether the item qualifies as conversational input.
    pub is_meaningful: bool,
    /// Whitespace-separated word count of `text`.
    pub word_count: usize,
}
