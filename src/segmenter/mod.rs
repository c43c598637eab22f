//! Frame-driven speech segmentation.
//!
//! A two-state machine (Silence/Speech) over fixed-size PCM frames.
//! Classical transitions use enter/exit hysteresis with consecutive-frame
//! counting; burst mode captures short, loud utterances that would never
//! satisfy the classical enter streak. Detected segments are emitted as
//! self-contained WAV chunks with pre-roll and zero-filled post-padding.
//!
//! All decisions are made in frame counts, so the segmenter is fully
//! deterministic for a given frame stream.

use crate::audio::features::{analyze, FrameFeatures};
use crate::audio::frame::PcmFrame;
use crate::audio::wav;
use crate::config::SegmenterConfig;
use crate::pipeline::messages::{AudioChunk, SegmentEndReason};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tracing::{debug, error, info};

/// Segmenter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VadState {
    Silence,
    Speech,
}

impl VadState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Silence => "silence",
            Self::Speech => "speech",
        }
    }
}

/// Running averages for the periodic metrics line.
#[derive(Debug, Default)]
struct MetricsWindow {
    frames: u32,
    sum_rms: f64,
    sum_active_ratio: f64,
}

impl MetricsWindow {
    fn accumulate(&mut self, features: &FrameFeatures) {
        self.frames += 1;
        self.sum_rms += f64::from(features.rms);
        self.sum_active_ratio += f64::from(features.active_ratio);
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Frame-driven VAD segmenter producing WAV-encoded [`AudioChunk`]s.
pub struct Segmenter {
    config: SegmenterConfig,
    state: VadState,
    /// Ring of recent Silence frames used to prime a new segment.
    pre_roll: VecDeque<PcmFrame>,
    pre_roll_frames: usize,
    /// Frames of the segment being accumulated while in Speech.
    segment: Vec<PcmFrame>,
    enter_streak: u32,
    exit_streak: u32,
    /// Whether the current segment was entered via burst.
    burst_entry: bool,
    /// Frames remaining in the burst hold window.
    burst_hold_left: u32,
    burst_quiet_streak: u32,
    noise_floor_rms: f32,
    next_sequence: u64,
    metrics: MetricsWindow,
    metrics_interval_frames: u32,
}

impl Segmenter {
    /// Create a segmenter for the given configuration.
    #[must_use]
    pub fn new(config: SegmenterConfig) -> Self {
        let pre_roll_frames = config.frames_for_ms(config.prepend_padding_ms) as usize;
        let metrics_interval_frames = config.frames_for_ms(config.metrics_interval_ms);
        info!(
            "segmenter initialized: {}Hz, {}ms frames, enter_rms={}, exit_rms={}, adaptive={}",
            config.sample_rate,
            config.frame_ms,
            config.enter_rms,
            config.exit_rms,
            config.use_adaptive_thresholds,
        );
        Self {
            config,
            state: VadState::Silence,
            pre_roll: VecDeque::with_capacity(pre_roll_frames + 1),
            pre_roll_frames,
            segment: Vec::new(),
            enter_streak: 0,
            exit_streak: 0,
            burst_entry: false,
            burst_hold_left: 0,
            burst_quiet_streak: 0,
            noise_floor_rms: 0.0,
            next_sequence: 0,
            metrics: MetricsWindow::default(),
            metrics_interval_frames,
        }
    }

    /// Current adaptive noise floor estimate.
    #[must_use]
    pub fn noise_floor_rms(&self) -> f32 {
        self.noise_floor_rms
    }

    /// Drop any in-progress segment and pre-roll and return to Silence.
    /// Used after a capture fault; the noise floor and sequence counter
    /// survive.
    pub fn reset(&mut self) {
        self.reset_to_silence();
        self.pre_roll.clear();
    }

    /// Process one frame, returning a completed segment if one ended here.
    pub fn push_frame(&mut self, frame: PcmFrame, now: DateTime<Utc>) -> Option<AudioChunk> {
        let features = analyze(&frame, self.config.active_sample_abs_threshold);

        if self.state == VadState::Silence {
            self.update_noise_floor(features.rms);
        }
        let (enter_rms_eff, exit_rms_eff) = self.effective_thresholds();

        self.tick_metrics(&features, enter_rms_eff, exit_rms_eff);

        match self.state {
            VadState::Silence => {
                self.on_silence_frame(frame, &features, enter_rms_eff);
                None
            }
            VadState::Speech => self.on_speech_frame(frame, &features, exit_rms_eff, now),
        }
    }

    fn update_noise_floor(&mut self, rms: f32) {
        if !self.config.use_adaptive_thresholds {
            return;
        }
        let alpha = self.config.noise_floor_alpha.clamp(0.0001, 1.0);
        self.noise_floor_rms = (1.0 - alpha) * self.noise_floor_rms + alpha * rms;
    }

    fn effective_thresholds(&self) -> (f32, f32) {
        if self.config.use_adaptive_thresholds {
            (
                self.config
                    .enter_rms
                    .max(self.noise_floor_rms * self.config.noise_floor_enter_multiplier),
                self.config
                    .exit_rms
                    .max(self.noise_floor_rms * self.config.noise_floor_exit_multiplier),
            )
        } else {
            (self.config.enter_rms, self.config.exit_rms)
        }
    }

    fn on_silence_frame(&mut self, frame: PcmFrame, features: &FrameFeatures, enter_rms_eff: f32) {
        let burst = self.burst_trigger(features);
        let classical_qualifies = features.rms >= enter_rms_eff
            || features.active_ratio >= self.config.enter_active_ratio;

        if classical_qualifies {
            self.enter_streak += 1;
        } else {
            self.enter_streak = 0;
        }

        let classical = classical_qualifies && self.enter_streak >= self.config.enter_consecutive;

        if classical || burst {
            self.begin_segment(frame, burst && !classical);
            return;
        }

        self.pre_roll.push_back(frame);
        while self.pre_roll.len() > self.pre_roll_frames {
            let _ = self.pre_roll.pop_front();
        }
    }

    fn burst_trigger(&self, features: &FrameFeatures) -> bool {
        let by_rms =
            self.config.burst_enter_rms > 0.0 && features.rms >= self.config.burst_enter_rms;
        let by_peak = self.config.burst_peak_abs_threshold > 0.0
            && features.peak_abs >= self.config.burst_peak_abs_threshold;
        by_rms || by_peak
    }

    fn begin_segment(&mut self, trigger: PcmFrame, burst: bool) {
        self.state = VadState::Speech;
        self.segment.clear();
        self.segment.extend(self.pre_roll.drain(..));
        self.segment.push(trigger);
        self.enter_streak = 0;
        self.exit_streak = 0;
        self.burst_quiet_streak = 0;
        self.burst_entry = burst;
        self.burst_hold_left = if burst {
            self.config.frames_for_ms(self.config.burst_window_ms)
        } else {
            0
        };
        debug!(
            "speech start ({}), primed with {} frames",
            if burst { "burst" } else { "vad" },
            self.segment.len(),
        );
    }

    fn on_speech_frame(
        &mut self,
        frame: PcmFrame,
        features: &FrameFeatures,
        exit_rms_eff: f32,
        now: DateTime<Utc>,
    ) -> Option<AudioChunk> {
        self.segment.push(frame);
        let duration_ms = self.segment.len() as u32 * self.config.frame_ms;

        // Max-length flush wins over every exit policy.
        if duration_ms >= self.config.max_segment_ms {
            return self.flush_max(now);
        }

        // Inside the burst hold window no exit policy applies.
        if self.burst_hold_left > 0 {
            self.burst_hold_left -= 1;
            return None;
        }

        let quiet = features.rms <= exit_rms_eff
            && features.active_ratio <= self.config.exit_active_ratio;

        if quiet {
            self.exit_streak += 1;
        } else {
            self.exit_streak = 0;
        }

        if self.burst_entry {
            if quiet {
                self.burst_quiet_streak += 1;
            } else {
                self.burst_quiet_streak = 0;
            }
        }

        // Classical exit wins when both are eligible on the same frame.
        if self.exit_streak >= self.config.exit_consecutive {
            return self.end_segment(SegmentEndReason::Vad, duration_ms, now);
        }

        if self.burst_entry && self.burst_quiet_streak >= self.config.burst_quiet_consecutive {
            let required = self
                .config
                .burst_min_segment_ms
                .max(self.config.min_segment_ms);
            if duration_ms >= required {
                return self.emit(SegmentEndReason::Burst, duration_ms, now);
            }
            debug!("burst segment too short ({duration_ms}ms < {required}ms), discarded");
            self.reset_to_silence();
            return None;
        }

        None
    }

    fn end_segment(
        &mut self,
        reason: SegmentEndReason,
        duration_ms: u32,
        now: DateTime<Utc>,
    ) -> Option<AudioChunk> {
        if duration_ms < self.config.min_segment_ms {
            debug!(
                "segment too short ({duration_ms}ms < {}ms), discarded",
                self.config.min_segment_ms,
            );
            self.reset_to_silence();
            return None;
        }
        self.emit(reason, duration_ms, now)
    }

    /// Forced emission at the maximum length. Speech continues, so the
    /// state stays Speech and the next segment starts empty.
    fn flush_max(&mut self, now: DateTime<Utc>) -> Option<AudioChunk> {
        let duration_ms = self.segment.len() as u32 * self.config.frame_ms;
        let chunk = self.encode_segment(SegmentEndReason::Max, duration_ms, now);
        self.segment.clear();
        self.exit_streak = 0;
        self.burst_quiet_streak = 0;
        self.burst_entry = false;
        self.burst_hold_left = 0;
        chunk
    }

    fn emit(
        &mut self,
        reason: SegmentEndReason,
        duration_ms: u32,
        now: DateTime<Utc>,
    ) -> Option<AudioChunk> {
        let chunk = self.encode_segment(reason, duration_ms, now);
        self.reset_to_silence();
        chunk
    }

    fn encode_segment(
        &mut self,
        reason: SegmentEndReason,
        duration_ms: u32,
        now: DateTime<Utc>,
    ) -> Option<AudioChunk> {
        let frame_count = self.segment.len() as u32;
        let frame_bytes = self.config.frame_bytes();
        let padding_frames = self.config.frames_for_ms(self.config.append_padding_ms) as usize;

        let mut pcm = Vec::with_capacity((self.segment.len() + padding_frames) * frame_bytes);
        for frame in &self.segment {
            pcm.extend_from_slice(&frame.data);
        }
        pcm.resize(pcm.len() + padding_frames * frame_bytes, 0);

        let wav = match wav::encode_wav(self.config.sample_rate, self.config.channels, &pcm) {
            Ok(wav) => wav,
            Err(e) => {
                error!("segment WAV encoding failed, segment discarded: {e}");
                return None;
            }
        };

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        if self.config.enable_metrics {
            info!(
                "segment seq={sequence} duration_ms={duration_ms} frames={frame_count} reason={}",
                reason.as_str(),
            );
        }

        Some(AudioChunk {
            sequence,
            timestamp_utc: now,
            duration_ms,
            frame_count,
            wav,
            end_reason: reason,
        })
    }

    fn reset_to_silence(&mut self) {
        self.state = VadState::Silence;
        self.segment.clear();
        self.enter_streak = 0;
        self.exit_streak = 0;
        self.burst_entry = false;
        self.burst_hold_left = 0;
        self.burst_quiet_streak = 0;
    }

    fn tick_metrics(&mut self, features: &FrameFeatures, enter_rms_eff: f32, exit_rms_eff: f32) {
        if !self.config.enable_metrics || self.metrics_interval_frames == 0 {
            return;
        }
        self.metrics.accumulate(features);
        if self.metrics.frames < self.metrics_interval_frames {
            return;
        }
        let frames = f64::from(self.metrics.frames);
        info!(
            "segmenter state={} avg_rms={:.4} avg_active_ratio={:.4} noise_floor={:.4} enter_eff={:.4} exit_eff={:.4}",
            self.state.as_str(),
            self.metrics.sum_rms / frames,
            self.metrics.sum_active_ratio / frames,
            self.noise_floor_rms,
            enter_rms_eff,
            exit_rms_eff,
        );
        self.metrics.reset();
    }
}
