//! Time source abstraction.
//!
//! Every externally visible timestamp in the pipeline comes from a
//! [`Clock`], so the conversation state machine and the store can be
//! driven deterministically in tests.

use chrono::{DateTime, Utc};

/// Narrow time capability used by the FSM, orchestrator and store.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
