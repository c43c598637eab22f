//! In-memory WAV encoding and inspection.

use crate::error::{AssistantError, Result};
use std::io::Cursor;

/// Encode raw 16-bit LE PCM bytes as a self-contained, seekable WAV stream.
///
/// An odd trailing byte (malformed input) is dropped rather than rejected.
///
/// # Errors
///
/// Returns an error if the WAV writer fails, which for an in-memory buffer
/// only happens on a malformed spec.
pub fn encode_wav(sample_rate: u32, channels: u16, pcm: &[u8]) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut buf = Vec::with_capacity(44 + pcm.len());
    {
        let cursor = Cursor::new(&mut buf);
        let mut writer = hound::WavWriter::new(cursor, spec)
            .map_err(|e| AssistantError::Audio(format!("cannot create WAV writer: {e}")))?;

        for pair in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            writer
                .write_sample(sample)
                .map_err(|e| AssistantError::Audio(format!("cannot write WAV sample: {e}")))?;
        }

        writer
            .finalize()
            .map_err(|e| AssistantError::Audio(format!("cannot finalize WAV stream: {e}")))?;
    }

    Ok(buf)
}

/// RMS of the normalized samples in a WAV stream.
///
/// # Errors
///
/// Returns an error if the stream is not parseable WAV.
pub fn wav_rms(wav: &[u8]) -> Result<f32> {
    let mut reader = hound::WavReader::new(Cursor::new(wav))
        .map_err(|e| AssistantError::Audio(format!("cannot parse WAV stream: {e}")))?;

    let mut sum_sq = 0.0f64;
    let mut count = 0usize;
    for sample in reader.samples::<i16>() {
        let sample =
            sample.map_err(|e| AssistantError::Audio(format!("cannot read WAV sample: {e}")))?;
        let x = f64::from(sample) / 32768.0;
        sum_sq += x * x;
        count += 1;
    }

    if count == 0 {
        return Ok(0.0);
    }
    Ok((sum_sq / count as f64).sqrt() as f32)
}
