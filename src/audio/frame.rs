//! Fixed-size PCM frame assembly.

/// One fixed-size frame of 16-bit LE mono PCM audio.
#[derive(Debug, Clone)]
pub struct PcmFrame {
    /// Monotonic frame index within the session.
    pub index: u64,
    /// Raw sample bytes, exactly `frame_bytes` long.
    pub data: Vec<u8>,
}

impl PcmFrame {
    /// Iterate the frame's samples as i16 values.
    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.data
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
    }

    /// Number of samples in the frame.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.data.len() / 2
    }
}

/// Re-slices variable-size capture buffers into fixed-size frames.
///
/// A carry buffer holds the sub-frame remainder between inputs, so frame
/// `i` always covers audio captured before frame `i + 1`. Input sizes are
/// never an error; whatever does not fill a frame simply waits for the
/// next buffer.
pub struct FrameAssembler {
    frame_bytes: usize,
    carry: Vec<u8>,
    next_index: u64,
}

impl FrameAssembler {
    /// Create an assembler producing frames of exactly `frame_bytes` bytes.
    #[must_use]
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            frame_bytes,
            carry: Vec::with_capacity(frame_bytes),
            next_index: 0,
        }
    }

    /// Feed a capture buffer and collect every completed frame.
    pub fn push(&mut self, buffer: &[u8]) -> Vec<PcmFrame> {
        let mut frames = Vec::new();
        if self.frame_bytes == 0 {
            return frames;
        }

        self.carry.extend_from_slice(buffer);

        while self.carry.len() >= self.frame_bytes {
            let data: Vec<u8> = self.carry.drain(..self.frame_bytes).collect();
            frames.push(PcmFrame {
                index: self.next_index,
                data,
            });
            self.next_index += 1;
        }

        frames
    }

    /// Discard any partial carry. Used on cancellation; completed frames
    /// already handed out stay valid.
    pub fn reset(&mut self) {
        self.carry.clear();
    }

    /// Bytes currently held back waiting for a full frame.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.carry.len()
    }
}
