//! Pipeline coordination: wires all stages together.
//!
//! Four long-lived tasks carry the audio path — capture/segmentation,
//! transcription, the FSM consumer and the ticker — joined by two bounded
//! oldest-drop queues. Two more tasks subscribe to the FSM's event stream:
//! the suppression sync and the prompt orchestrator. A single
//! `CancellationToken` stops everything; a gracefully ending audio source
//! completes the stages in order instead.

pub mod channel;
pub mod messages;

use crate::audio::frame::FrameAssembler;
use crate::clock::{Clock, SystemClock};
use crate::config::AssistantConfig;
use crate::error::Result;
use crate::fsm::{ConversationFsm, FsmEvent};
use crate::orchestrator::PromptOrchestrator;
use crate::pipeline::channel::{ring_channel, RingReceiver, RingSender};
use crate::pipeline::messages::{AudioChunk, TranscriptionItem};
use crate::segmenter::Segmenter;
use crate::store::ConversationStore;
use crate::suppression::SuppressionGate;
use crate::traits::{AudioSource, ContextProvider, LanguageModel, SpeechToText, TextToSpeech};
use crate::transcriber::run_transcriber_stage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Owns the stage tasks of one assistant session.
pub struct AssistantPipeline {
    config: AssistantConfig,
    source: Box<dyn AudioSource>,
    stt: Arc<dyn SpeechToText>,
    fsm: Arc<ConversationFsm>,
    gate: Arc<SuppressionGate>,
    store: Arc<ConversationStore>,
    orchestrator: Arc<PromptOrchestrator>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl AssistantPipeline {
    /// Build a pipeline on the system clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the store
    /// cannot be opened.
    pub fn new(
        config: AssistantConfig,
        source: Box<dyn AudioSource>,
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Option<Arc<dyn TextToSpeech>>,
    ) -> Result<Self> {
        Self::with_clock(config, source, stt, llm, tts, Arc::new(SystemClock))
    }

    /// Build a pipeline with an explicit clock (tests drive time manually).
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the store
    /// cannot be opened.
    pub fn with_clock(
        config: AssistantConfig,
        source: Box<dyn AudioSource>,
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Option<Arc<dyn TextToSpeech>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(ConversationStore::new(&config.context)?);
        let fsm = Arc::new(ConversationFsm::new(&config.host, Arc::clone(&clock)));
        let gate = Arc::new(SuppressionGate::new(config.host.suppression_tail_grace_ms));
        let orchestrator = Arc::new(PromptOrchestrator::new(
            &config.context,
            Arc::clone(&store),
            Arc::clone(&store) as Arc<dyn ContextProvider>,
            llm,
            tts,
            Arc::clone(&fsm),
            Arc::clone(&clock),
        )?);

        Ok(Self {
            config,
            source,
            stt,
            fsm,
            gate,
            store,
            orchestrator,
            clock,
            cancel: CancellationToken::new(),
        })
    }

    /// The conversation state machine, for host-driven transitions.
    #[must_use]
    pub fn fsm(&self) -> Arc<ConversationFsm> {
        Arc::clone(&self.fsm)
    }

    /// The conversation store backing this session.
    #[must_use]
    pub fn store(&self) -> Arc<ConversationStore> {
        Arc::clone(&self.store)
    }

    /// Subscribe to FSM events (state changes, composed prompts).
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<FsmEvent> {
        self.fsm.subscribe()
    }

    /// The cancellation token stopping every stage.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the session until the audio source ends or the token fires.
    ///
    /// # Errors
    ///
    /// Joins every stage; an error is returned only if a stage panicked.
    pub async fn run(self) -> Result<()> {
        let cancel = self.cancel;
        let (audio_tx, audio_rx) = ring_channel::<AudioChunk>(self.config.host.audio_queue_capacity);
        let (item_tx, item_rx) =
            ring_channel::<TranscriptionItem>(self.config.host.transcription_queue_capacity);

        info!("assistant pipeline starting");

        let capture_handle = {
            let config = self.config.segmenter.clone();
            let clock = Arc::clone(&self.clock);
            let cancel = cancel.clone();
            let source = self.source;
            tokio::spawn(async move {
                run_capture_stage(config, source, audio_tx, clock, cancel).await;
            })
        };

        let transcriber_handle = {
            let config = self.config.stt.clone();
            let stt = Arc::clone(&self.stt);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_transcriber_stage(config, stt, audio_rx, item_tx, cancel).await;
            })
        };

        let consumer_handle = {
            let fsm = Arc::clone(&self.fsm);
            let gate = Arc::clone(&self.gate);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_fsm_consumer(gate, fsm, item_rx, cancel).await;
            })
        };

        let ticker_handle = {
            let fsm = Arc::clone(&self.fsm);
            let clock = Arc::clone(&self.clock);
            let interval_ms = self.config.host.ticker_interval_ms;
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_ticker(fsm, clock, interval_ms, cancel).await;
            })
        };

        let suppression_handle = {
            let gate = Arc::clone(&self.gate);
            let events = self.fsm.subscribe();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_suppression_sync(gate, events, cancel).await;
            })
        };

        let orchestrator_handle = {
            let orchestrator = Arc::clone(&self.orchestrator);
            let events = self.fsm.subscribe();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                orchestrator.run(events, cancel).await;
            })
        };

        // The audio path winds down in order, on source end or on
        // cancellation: capture end closes the audio queue, the transcriber
        // closes the item queue, the consumer exits.
        let _ = capture_handle.await;
        let _ = transcriber_handle.await;
        let _ = consumer_handle.await;
        cancel.cancel();

        let _ = ticker_handle.await;
        let _ = suppression_handle.await;
        let _ = orchestrator_handle.await;

        info!("assistant pipeline stopped");
        Ok(())
    }
}

/// Capture stage: raw buffers → frames → segmenter → audio queue.
async fn run_capture_stage(
    config: crate::config::SegmenterConfig,
    mut source: Box<dyn AudioSource>,
    audio_tx: RingSender<AudioChunk>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) {
    let mut assembler = FrameAssembler::new(config.frame_bytes());
    let mut segmenter = Segmenter::new(config);

    loop {
        let buffer = tokio::select! {
            () = cancel.cancelled() => {
                // Cancellation flushes nothing.
                assembler.reset();
                break;
            }
            buffer = source.next_buffer() => buffer,
        };

        match buffer {
            Ok(Some(bytes)) => {
                for frame in assembler.push(&bytes) {
                    if let Some(chunk) = segmenter.push_frame(frame, clock.now_utc()) {
                        if let Some(displaced) = audio_tx.send(chunk) {
                            warn!(
                                "audio queue full, dropped chunk seq={} (total dropped: {})",
                                displaced.sequence,
                                audio_tx.dropped(),
                            );
                        }
                    }
                }
            }
            Ok(None) => {
                info!("audio source ended");
                break;
            }
            Err(e) => {
                // Transient: the segment in flight is gone, capture goes on.
                warn!("capture error, discarding current segment: {e}");
                assembler.reset();
                segmenter.reset();
            }
        }
    }
    // Dropping audio_tx here completes the downstream channel.
    debug!("capture stage stopped");
}

/// FSM consumer: admitted transcriptions drive the state machine.
async fn run_fsm_consumer(
    gate: Arc<SuppressionGate>,
    fsm: Arc<ConversationFsm>,
    mut item_rx: RingReceiver<TranscriptionItem>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            () = cancel.cancelled() => break,
            item = item_rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        if gate.admit(item.timestamp_utc) {
            fsm.handle_transcription(&item);
        }
    }
    debug!("fsm consumer stopped");
}

/// Ticker: advances the FSM's silence timers without new input.
async fn run_ticker(
    fsm: Arc<ConversationFsm>,
    clock: Arc<dyn Clock>,
    interval_ms: u64,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => fsm.tick(clock.now_utc()),
        }
    }
    debug!("ticker stopped");
}

/// Suppression sync: mirrors FSM transitions into the gate's window.
async fn run_suppression_sync(
    gate: Arc<SuppressionGate>,
    mut events: broadcast::Receiver<FsmEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(FsmEvent::StateChanged { from, to, at, .. }) => {
                gate.note_transition(from, to, at);
            }
            Ok(FsmEvent::PromptReady { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("suppression sync lagged behind {skipped} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("suppression sync stopped");
}
