//! Prompt orchestration.
//!
//! Subscribes to the state machine's event stream and, on each composed
//! prompt, runs one conversation turn: persist the user message, gather
//! context, call the language model, persist the reply, optionally speak
//! it. Whatever happens, the state machine is returned to Listening.

use crate::clock::Clock;
use crate::config::ContextConfig;
use crate::error::{AssistantError, Result};
use crate::fsm::{ConversationFsm, FsmEvent};
use crate::store::{ChatMessage, ChatRole, ConversationStore};
use crate::traits::{ContextProvider, LanguageModel, PromptMessage, StructuredPrompt, TextToSpeech};
use regex::Regex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runs one conversation turn per composed prompt.
pub struct PromptOrchestrator {
    store: Arc<ConversationStore>,
    context: Arc<dyn ContextProvider>,
    llm: Arc<dyn LanguageModel>,
    tts: Option<Arc<dyn TextToSpeech>>,
    fsm: Arc<ConversationFsm>,
    clock: Arc<dyn Clock>,
    system_prompt: String,
    last_n: usize,
    reply_filters: Vec<Regex>,
}

impl PromptOrchestrator {
    /// Build an orchestrator, compiling the configured reply filters.
    ///
    /// `tts` of `None` disables spoken replies; the turn then ends with
    /// `end_processing` instead of the speaking cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if a reply filter pattern does not compile.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &ContextConfig,
        store: Arc<ConversationStore>,
        context: Arc<dyn ContextProvider>,
        llm: Arc<dyn LanguageModel>,
        tts: Option<Arc<dyn TextToSpeech>>,
        fsm: Arc<ConversationFsm>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let reply_filters = config
            .reply_filters
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    AssistantError::Config(format!("invalid reply filter '{pattern}': {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            store,
            context,
            llm,
            tts,
            fsm,
            clock,
            system_prompt: config.system_prompt.clone(),
            last_n: config.last_n,
            reply_filters,
        })
    }

    /// Drain the event stream until cancellation. Each prompt is handled on
    /// a detached task so a slow model call never blocks event delivery.
    pub async fn run(
        self: Arc<Self>,
        mut events: tokio::sync::broadcast::Receiver<FsmEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(FsmEvent::PromptReady { prompt, .. }) => {
                    let orchestrator = Arc::clone(&self);
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        orchestrator.handle_prompt(prompt, &cancel).await;
                    });
                }
                Ok(FsmEvent::StateChanged { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("orchestrator lagged behind {skipped} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("orchestrator stopped");
    }

    /// Run one conversation turn for a composed prompt.
    pub async fn handle_prompt(&self, prompt: String, cancel: &CancellationToken) {
        info!("prompt ready: \"{prompt}\"");
        match self.run_turn(&prompt, cancel).await {
            Ok(spoke) => {
                if spoke {
                    self.fsm.end_speaking();
                } else {
                    self.fsm.end_processing();
                }
            }
            Err(TurnFailure { error, spoke }) => {
                if !cancel.is_cancelled() {
                    error!("conversation turn failed: {error}");
                }
                if spoke {
                    self.fsm.end_speaking();
                } else {
                    self.fsm.end_processing();
                }
            }
        }
    }

    /// The fallible body of a turn. Returns whether Speaking was entered.
    async fn run_turn(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<bool, TurnFailure> {
        let user_message = ChatMessage::new(ChatRole::User, prompt, self.clock.now_utc());
        self.store
            .append(&user_message)
            .map_err(TurnFailure::before_speaking)?;

        let context = match self.context.get_context(prompt, self.last_n).await {
            Ok(context) => context,
            Err(e) => {
                warn!("context unavailable, continuing without: {e}");
                Vec::new()
            }
        };

        let structured = StructuredPrompt {
            system_prompt: self.system_prompt.clone(),
            context: context.iter().map(PromptMessage::from).collect(),
            user: PromptMessage::from(&user_message),
            now_utc: self.clock.now_utc(),
        };

        let raw_reply = self
            .llm
            .get_response(&structured, cancel)
            .await
            .map_err(TurnFailure::before_speaking)?;
        let reply = self.filter_reply(&raw_reply);

        let assistant_message =
            ChatMessage::new(ChatRole::Assistant, reply.clone(), self.clock.now_utc());
        self.store
            .append(&assistant_message)
            .map_err(TurnFailure::before_speaking)?;

        let Some(tts) = &self.tts else {
            return Ok(false);
        };
        if reply.is_empty() {
            debug!("reply empty after filtering, nothing to speak");
            return Ok(false);
        }

        self.fsm.begin_speaking();
        tts.speak_default(&reply, cancel)
            .await
            .map_err(TurnFailure::while_speaking)?;
        Ok(true)
    }

    /// Apply the configured filters and trim the result.
    fn filter_reply(&self, reply: &str) -> String {
        let mut filtered = reply.to_owned();
        for filter in &self.reply_filters {
            filtered = filter.replace_all(&filtered, "").into_owned();
        }
        filtered.trim().to_owned()
    }
}

/// A failed turn and whether Speaking had already been entered.
struct TurnFailure {
    error: AssistantError,
    spoke: bool,
}

impl TurnFailure {
    fn before_speaking(error: AssistantError) -> Self {
        Self {
            error,
            spoke: false,
        }
    }

    fn while_speaking(error: AssistantError) -> Self {
        Self { error, spoke: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::config::HostConfig;
    use crate::fsm::ConversationMode;
    use crate::pipeline::messages::TranscriptionItem;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    struct ScriptedLlm {
        reply: Result<String>,
        seen_prompts: Mutex<Vec<StructuredPrompt>>,
    }

    #[async_trait]
    impl LanguageModel for ScriptedLlm {
        async fn get_response(
            &self,
            prompt: &StructuredPrompt,
            _cancel: &CancellationToken,
        ) -> Result<String> {
            self.seen_prompts.lock().unwrap().push(prompt.clone());
            match &self.reply {
                Ok(reply) => Ok(reply.clone()),
                Err(e) => Err(AssistantError::Llm(e.to_string())),
            }
        }
    }

    struct RecordingTts {
        spoken: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl TextToSpeech for RecordingTts {
        async fn speak_default(&self, text: &str, _cancel: &CancellationToken) -> Result<()> {
            self.spoken.lock().unwrap().push(text.to_owned());
            if self.fail {
                Err(AssistantError::Tts("no output device".into()))
            } else {
                Ok(())
            }
        }
    }

    struct Fixture {
        orchestrator: Arc<PromptOrchestrator>,
        fsm: Arc<ConversationFsm>,
        store: Arc<ConversationStore>,
        llm: Arc<ScriptedLlm>,
        tts: Option<Arc<RecordingTts>>,
        _tmp: tempfile::TempDir,
    }

    fn fixture(reply: Result<String>, tts: Option<RecordingTts>, filters: Vec<String>) -> Fixture {
        let tmp = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 16, 0, 0).unwrap(),
        ));
        let config = ContextConfig {
            storage_root: Some(tmp.path().to_path_buf()),
            encryption_key: String::new(),
            reply_filters: filters,
            ..ContextConfig::default()
        };
        let store = Arc::new(ConversationStore::new(&config).expect("store"));
        let host = HostConfig {
            wake_word: "wren".to_owned(),
            processing_silence_seconds: 0.05,
            ..HostConfig::default()
        };
        let fsm = Arc::new(ConversationFsm::new(
            &host,
            Arc::clone(&clock) as Arc<dyn Clock>,
        ));
        let llm = Arc::new(ScriptedLlm {
            reply,
            seen_prompts: Mutex::new(Vec::new()),
        });
        let tts = tts.map(Arc::new);
        let orchestrator = Arc::new(
            PromptOrchestrator::new(
                &config,
                Arc::clone(&store),
                Arc::clone(&store) as Arc<dyn ContextProvider>,
                Arc::clone(&llm) as Arc<dyn LanguageModel>,
                tts.clone().map(|t| t as Arc<dyn TextToSpeech>),
                Arc::clone(&fsm),
                clock as Arc<dyn Clock>,
            )
            .expect("orchestrator"),
        );
        Fixture {
            orchestrator,
            fsm,
            store,
            llm,
            tts,
            _tmp: tmp,
        }
    }

    /// Drive the FSM into Processing the way a real turn does.
    fn enter_processing(fsm: &ConversationFsm) {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 16, 0, 0).unwrap();
        fsm.handle_transcription(&TranscriptionItem {
            sequence: 0,
            timestamp_utc: t0,
            text: "wren hello".to_owned(),
            is_meaningful: true,
            word_count: 2,
        });
        fsm.tick(t0 + chrono::Duration::milliseconds(60));
        assert_eq!(fsm.mode(), ConversationMode::Processing);
    }

    #[tokio::test]
    async fn successful_turn_persists_both_messages() {
        let fx = fixture(Ok("hi there!".to_owned()), None, Vec::new());
        enter_processing(&fx.fsm);

        fx.orchestrator
            .handle_prompt("wren hello".to_owned(), &CancellationToken::new())
            .await;

        assert_eq!(fx.fsm.mode(), ConversationMode::Listening);
        let tail = fx.store.tail(10).expect("tail");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].role, ChatRole::User);
        assert_eq!(tail[0].content, "wren hello");
        assert_eq!(tail[1].role, ChatRole::Assistant);
        assert_eq!(tail[1].content, "hi there!");
    }

    #[tokio::test]
    async fn structured_prompt_carries_context_and_system_prompt() {
        let fx = fixture(Ok("noted".to_owned()), None, Vec::new());
        fx.store
            .append(&ChatMessage::new(
                ChatRole::Assistant,
                "earlier reply",
                Utc.with_ymd_and_hms(2025, 6, 1, 15, 0, 0).unwrap(),
            ))
            .expect("append");
        enter_processing(&fx.fsm);

        fx.orchestrator
            .handle_prompt("what did you say?".to_owned(), &CancellationToken::new())
            .await;

        let prompts = fx.llm.seen_prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        let prompt = &prompts[0];
        assert!(!prompt.system_prompt.is_empty());
        assert_eq!(prompt.user.content, "what did you say?");
        assert_eq!(prompt.user.role, "user");
        // Context includes the earlier reply and the just-persisted user turn.
        assert!(prompt
            .context
            .iter()
            .any(|m| m.content == "earlier reply"));
    }

    #[tokio::test]
    async fn tts_path_cycles_through_speaking() {
        let fx = fixture(
            Ok("spoken reply".to_owned()),
            Some(RecordingTts {
                spoken: Mutex::new(Vec::new()),
                fail: false,
            }),
            Vec::new(),
        );
        enter_processing(&fx.fsm);
        let mut events = fx.fsm.subscribe();

        fx.orchestrator
            .handle_prompt("wren hello".to_owned(), &CancellationToken::new())
            .await;

        assert_eq!(fx.fsm.mode(), ConversationMode::Listening);
        let spoken = fx.tts.as_ref().unwrap().spoken.lock().unwrap().clone();
        assert_eq!(spoken, vec!["spoken reply".to_owned()]);

        let mut modes = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let FsmEvent::StateChanged { to, .. } = event {
                modes.push(to);
            }
        }
        assert_eq!(
            modes,
            vec![ConversationMode::Speaking, ConversationMode::Listening],
        );
    }

    #[tokio::test]
    async fn llm_failure_returns_fsm_to_listening() {
        let fx = fixture(
            Err(AssistantError::Llm("model crashed".into())),
            None,
            Vec::new(),
        );
        enter_processing(&fx.fsm);

        fx.orchestrator
            .handle_prompt("wren hello".to_owned(), &CancellationToken::new())
            .await;

        assert_eq!(fx.fsm.mode(), ConversationMode::Listening);
        // The user message was persisted before the failure; no reply was.
        let tail = fx.store.tail(10).expect("tail");
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].role, ChatRole::User);
    }

    #[tokio::test]
    async fn tts_failure_still_ends_speaking() {
        let fx = fixture(
            Ok("doomed reply".to_owned()),
            Some(RecordingTts {
                spoken: Mutex::new(Vec::new()),
                fail: true,
            }),
            Vec::new(),
        );
        enter_processing(&fx.fsm);

        fx.orchestrator
            .handle_prompt("wren hello".to_owned(), &CancellationToken::new())
            .await;

        assert_eq!(fx.fsm.mode(), ConversationMode::Listening);
        assert!(!fx.fsm.is_speaking());
    }

    #[tokio::test]
    async fn reply_filters_strip_boilerplate() {
        let fx = fixture(
            Ok("As an AI assistant, I must say: hello!  ".to_owned()),
            None,
            vec!["(?i)^as an ai assistant,?\\s*i must say:\\s*".to_owned()],
        );
        enter_processing(&fx.fsm);

        fx.orchestrator
            .handle_prompt("wren hello".to_owned(), &CancellationToken::new())
            .await;

        let tail = fx.store.tail(10).expect("tail");
        assert_eq!(tail[1].content, "hello!");
    }

    #[test]
    fn invalid_reply_filter_is_a_config_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 16, 0, 0).unwrap(),
        ));
        let config = ContextConfig {
            storage_root: Some(tmp.path().to_path_buf()),
            encryption_key: String::new(),
            reply_filters: vec!["[unclosed".to_owned()],
            ..ContextConfig::default()
        };
        let store = Arc::new(ConversationStore::new(&config).expect("store"));
        let fsm = Arc::new(ConversationFsm::new(
            &HostConfig::default(),
            Arc::clone(&clock) as Arc<dyn Clock>,
        ));
        let llm = Arc::new(ScriptedLlm {
            reply: Ok(String::new()),
            seen_prompts: Mutex::new(Vec::new()),
        });

        let result = PromptOrchestrator::new(
            &config,
            Arc::clone(&store),
            store as Arc<dyn ContextProvider>,
            llm as Arc<dyn LanguageModel>,
            None,
            fsm,
            clock as Arc<dyn Clock>,
        );
        assert!(matches!(result, Err(AssistantError::Config(_))));
    }
}
