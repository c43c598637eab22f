//! Transcription stage: audio chunks in, transcription items out.
//!
//! A single consumer drains the audio-chunk queue, so ASR calls are
//! naturally serialized and transcriptions preserve chunk order.

use crate::audio::wav;
use crate::config::SttConfig;
use crate::error::Result;
use crate::pipeline::channel::{RingReceiver, RingSender};
use crate::pipeline::messages::{AudioChunk, TranscriptionItem};
use crate::traits::SpeechToText;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Classify a transcription into a [`TranscriptionItem`] for a chunk.
#[must_use]
pub fn classify(chunk: &AudioChunk, text: String, min_words: usize) -> TranscriptionItem {
    let word_count = text.split_whitespace().count();
    let is_meaningful = !text.trim().is_empty() && word_count >= min_words.max(1);
    TranscriptionItem {
        sequence: chunk.sequence,
        timestamp_utc: chunk.timestamp_utc,
        text,
        is_meaningful,
        word_count,
    }
}

/// Transcribe one chunk, applying the pre-ASR silence gate.
///
/// # Errors
///
/// Returns an error if the WAV stream is malformed or the ASR call fails.
async fn transcribe_chunk(
    stt: &dyn SpeechToText,
    config: &SttConfig,
    chunk: &AudioChunk,
) -> Result<String> {
    let rms = wav::wav_rms(&chunk.wav)?;
    if rms < config.silence_rms_threshold {
        debug!(
            "chunk seq={} below silence gate (rms={rms:.4}), ASR bypassed",
            chunk.sequence,
        );
        return Ok(String::new());
    }
    stt.transcribe(&chunk.wav).await
}

/// Run the transcription stage until the audio queue closes or `cancel`
/// fires. An ASR failure drops the chunk; nothing is synthesized for it.
pub async fn run_transcriber_stage(
    config: SttConfig,
    stt: Arc<dyn SpeechToText>,
    mut audio_rx: RingReceiver<AudioChunk>,
    item_tx: RingSender<TranscriptionItem>,
    cancel: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            () = cancel.cancelled() => break,
            chunk = audio_rx.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        // An in-flight ASR call is completed, not abandoned; cancellation
        // takes effect between chunks.
        let item = match transcribe_chunk(stt.as_ref(), &config, &chunk).await {
            Ok(text) => classify(&chunk, text, config.min_words),
            Err(e) => {
                warn!("transcription failed for chunk seq={}: {e}", chunk.sequence);
                continue;
            }
        };
        if cancel.is_cancelled() {
            break;
        }

        if item.is_meaningful {
            info!(
                "transcribed seq={} ({} words): \"{}\"",
                item.sequence, item.word_count, item.text,
            );
        }

        if item_tx.send(item).is_some() {
            warn!(
                "transcription queue full, dropped oldest (total dropped: {})",
                item_tx.dropped(),
            );
        }
        // The chunk's WAV buffer is released here.
        drop(chunk);
    }
    debug!("transcriber stage stopped");
}
