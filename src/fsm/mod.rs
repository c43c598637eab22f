//! Conversation state machine.
//!
//! Four modes: Quiescent (waiting for the wake word), Listening (buffering
//! utterances), Processing (a prompt is with the language model) and
//! Speaking (the reply is being played back). Transcriptions and a
//! periodic tick drive the machine; the host drives the Processing and
//! Speaking edges.
//!
//! The machine is synchronous under one mutex and never holds it across
//! I/O. It communicates outward only through a broadcast event stream:
//! subscribers drive side effects, the machine never calls into them.

use crate::clock::Clock;
use crate::config::HostConfig;
use crate::pipeline::messages::TranscriptionItem;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the event stream. Slow subscribers lag rather than block.
const EVENT_CHANNEL_SIZE: usize = 64;

/// Conversation mode. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationMode {
    /// Waiting for the wake word; everything else is discarded.
    Quiescent,
    /// Buffering meaningful utterances into the next prompt.
    Listening,
    /// A composed prompt is being answered.
    Processing,
    /// The reply is being spoken.
    Speaking,
}

impl ConversationMode {
    /// Short label for logs and events.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quiescent => "quiescent",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
        }
    }
}

/// Events emitted by the state machine.
#[derive(Debug, Clone)]
pub enum FsmEvent {
    /// A mode transition happened.
    StateChanged {
        /// Mode before the transition.
        from: ConversationMode,
        /// Mode after the transition.
        to: ConversationMode,
        /// Why the transition happened.
        reason: &'static str,
        /// When the transition happened.
        at: DateTime<Utc>,
    },
    /// A prompt was composed from the buffered utterances. Raised exactly
    /// once per Listening → Processing transition.
    PromptReady {
        /// Space-joined utterances in arrival order.
        prompt: String,
        /// When the prompt was composed.
        at: DateTime<Utc>,
    },
}

struct FsmInner {
    mode: ConversationMode,
    buffer: Vec<TranscriptionItem>,
    listening_since: Option<DateTime<Utc>>,
    last_heard: Option<DateTime<Utc>>,
    /// Edge trigger: one prompt consideration per silence episode.
    processing_considered: bool,
}

/// Wake-word gated conversation state machine.
pub struct ConversationFsm {
    wake_word: String,
    processing_silence: Duration,
    end_silence: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<FsmInner>,
    events: broadcast::Sender<FsmEvent>,
}

impl ConversationFsm {
    /// Create a state machine in Quiescent.
    #[must_use]
    pub fn new(config: &HostConfig, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            wake_word: config.wake_word.to_lowercase(),
            processing_silence: Duration::milliseconds(
                (config.processing_silence_seconds * 1000.0) as i64,
            ),
            end_silence: Duration::milliseconds((config.end_silence_seconds * 1000.0) as i64),
            clock,
            inner: Mutex::new(FsmInner {
                mode: ConversationMode::Quiescent,
                buffer: Vec::new(),
                listening_since: None,
                last_heard: None,
                processing_considered: false,
            }),
            events,
        }
    }

    /// Subscribe to the event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FsmEvent> {
        self.events.subscribe()
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> ConversationMode {
        self.inner.lock().expect("fsm lock").mode
    }

    /// Whether the reply is currently being spoken.
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.mode() == ConversationMode::Speaking
    }

    /// Feed an admitted transcription.
    pub fn handle_transcription(&self, item: &TranscriptionItem) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock().expect("fsm lock");
            match inner.mode {
                ConversationMode::Quiescent => {
                    if item.is_meaningful && self.wake_matches(&item.text) {
                        inner.mode = ConversationMode::Listening;
                        inner.listening_since = Some(item.timestamp_utc);
                        inner.last_heard = None;
                        inner.buffer.clear();
                        inner.processing_considered = false;
                        pending.push(FsmEvent::StateChanged {
                            from: ConversationMode::Quiescent,
                            to: ConversationMode::Listening,
                            reason: "wake",
                            at: item.timestamp_utc,
                        });
                        // The waking utterance is part of the conversation.
                        inner.buffer.push(item.clone());
                        inner.last_heard = Some(item.timestamp_utc);
                    }
                }
                ConversationMode::Listening => {
                    if item.is_meaningful {
                        inner.buffer.push(item.clone());
                        inner.last_heard = Some(item.timestamp_utc);
                        inner.processing_considered = false;
                    } else {
                        // A silent admit still advances the silence timers.
                        self.evaluate_silence(&mut inner, item.timestamp_utc, &mut pending);
                    }
                }
                ConversationMode::Processing | ConversationMode::Speaking => {
                    debug!(
                        "transcription seq={} ignored in {}",
                        item.sequence,
                        inner.mode.as_str(),
                    );
                }
            }
        }
        self.emit(pending);
    }

    /// Advance the silence timers.
    pub fn tick(&self, now: DateTime<Utc>) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock().expect("fsm lock");
            self.evaluate_silence(&mut inner, now, &mut pending);
        }
        self.emit(pending);
    }

    /// Host signal: reply playback starts. Accepted from Listening or
    /// Processing; a no-op elsewhere.
    pub fn begin_speaking(&self) {
        let at = self.clock.now_utc();
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock().expect("fsm lock");
            if matches!(
                inner.mode,
                ConversationMode::Listening | ConversationMode::Processing
            ) {
                let from = inner.mode;
                inner.mode = ConversationMode::Speaking;
                inner.buffer.clear();
                pending.push(FsmEvent::StateChanged {
                    from,
                    to: ConversationMode::Speaking,
                    reason: "speaking",
                    at,
                });
            }
        }
        self.emit(pending);
    }

    /// Host signal: reply playback finished. A no-op outside Speaking.
    pub fn end_speaking(&self) {
        self.return_to_listening(ConversationMode::Speaking, "speaking-ended");
    }

    /// Host signal: the turn finished without playback. A no-op outside
    /// Processing.
    pub fn end_processing(&self) {
        self.return_to_listening(ConversationMode::Processing, "processing-ended");
    }

    fn return_to_listening(&self, expected: ConversationMode, reason: &'static str) {
        let at = self.clock.now_utc();
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock().expect("fsm lock");
            if inner.mode != expected {
                return;
            }
            inner.mode = ConversationMode::Listening;
            inner.listening_since = Some(at);
            inner.last_heard = None;
            inner.processing_considered = false;
            pending.push(FsmEvent::StateChanged {
                from: expected,
                to: ConversationMode::Listening,
                reason,
                at,
            });
        }
        self.emit(pending);
    }

    fn wake_matches(&self, text: &str) -> bool {
        if self.wake_word.is_empty() {
            return true;
        }
        text.to_lowercase().contains(&self.wake_word)
    }

    /// Silence evaluation shared by ticks and silent admits. The listening
    /// timeout is checked first: a conversation that never produced a
    /// prompt lapses rather than composing one at the last moment.
    fn evaluate_silence(
        &self,
        inner: &mut FsmInner,
        now: DateTime<Utc>,
        pending: &mut Vec<FsmEvent>,
    ) {
        if inner.mode != ConversationMode::Listening {
            return;
        }
        let Some(listening_since) = inner.listening_since else {
            return;
        };

        if now - listening_since >= self.end_silence {
            inner.mode = ConversationMode::Quiescent;
            inner.buffer.clear();
            inner.listening_since = None;
            inner.last_heard = None;
            inner.processing_considered = false;
            pending.push(FsmEvent::StateChanged {
                from: ConversationMode::Listening,
                to: ConversationMode::Quiescent,
                reason: "listen-timeout",
                at: now,
            });
            return;
        }

        let anchor = inner.last_heard.unwrap_or(listening_since);
        if now - anchor >= self.processing_silence && !inner.processing_considered {
            if inner.buffer.is_empty() {
                // Nothing to compose; do not reset the silence anchors, so
                // the episode can still time out.
                inner.processing_considered = true;
                return;
            }
            let prompt = inner
                .buffer
                .iter()
                .map(|item| item.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            inner.buffer.clear();
            inner.mode = ConversationMode::Processing;
            inner.processing_considered = true;
            pending.push(FsmEvent::StateChanged {
                from: ConversationMode::Listening,
                to: ConversationMode::Processing,
                reason: "prompt",
                at: now,
            });
            pending.push(FsmEvent::PromptReady { prompt, at: now });
        }
    }

    /// Deliver events after the lock is released. A send error only means
    /// nobody is subscribed; subscriber trouble never reaches the machine.
    fn emit(&self, pending: Vec<FsmEvent>) {
        for event in pending {
            if let FsmEvent::StateChanged {
                from, to, reason, ..
            } = &event
            {
                debug!("{} -> {} ({reason})", from.as_str(), to.as_str());
            }
            let _ = self.events.send(event);
        }
    }
}
