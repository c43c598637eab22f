//! Feedback suppression.
//!
//! While the assistant is processing or speaking, the microphone keeps
//! running and may pick up the assistant's own output. The gate tracks the
//! Processing/Speaking interval (plus a trailing grace period for playback
//! bleed-through) and discards transcriptions captured inside it.

use crate::fsm::ConversationMode;
use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct WindowState {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    active: bool,
    dropped: u64,
}

/// Timestamp window during which transcriptions are discarded.
pub struct SuppressionGate {
    state: Mutex<WindowState>,
    tail_grace: Duration,
}

impl SuppressionGate {
    /// Create a gate with the given trailing grace period.
    #[must_use]
    pub fn new(tail_grace_ms: u64) -> Self {
        Self {
            state: Mutex::new(WindowState::default()),
            tail_grace: Duration::milliseconds(tail_grace_ms as i64),
        }
    }

    /// Observe an FSM transition and open or close the window.
    pub fn note_transition(&self, from: ConversationMode, to: ConversationMode, at: DateTime<Utc>) {
        let suppressing = |mode: ConversationMode| {
            matches!(mode, ConversationMode::Processing | ConversationMode::Speaking)
        };

        let mut state = self.state.lock().expect("suppression lock");
        if !suppressing(from) && suppressing(to) {
            state.start = Some(at);
            state.end = None;
            state.active = true;
        } else if suppressing(from) && !suppressing(to) {
            state.end = Some(at);
            state.active = false;
        }
    }

    /// Whether a transcription captured at `ts` may pass to the FSM.
    pub fn admit(&self, ts: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().expect("suppression lock");
        let admitted = if state.active {
            match state.start {
                Some(start) => ts < start,
                None => true,
            }
        } else {
            match (state.start, state.end) {
                (Some(start), Some(end)) => !(ts >= start && ts <= end + self.tail_grace),
                _ => true,
            }
        };

        if !admitted {
            state.dropped += 1;
            debug!(
                "suppressed transcription at {ts} (total suppressed: {})",
                state.dropped,
            );
        }
        admitted
    }

    /// Total transcriptions discarded so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.state.lock().expect("suppression lock").dropped
    }
}
