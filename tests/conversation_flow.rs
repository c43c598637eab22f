//! End-to-end conversation flow through the full pipeline.
//!
//! Drives a scripted audio source through segmentation, transcription,
//! the conversation state machine and the orchestrator, with hand-rolled
//! doubles for the external engines.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wren::config::{AssistantConfig, ContextConfig, HostConfig, SegmenterConfig, SttConfig};
use wren::fsm::FsmEvent;
use wren::store::ChatRole;
use wren::traits::{
    AudioSource, LanguageModel, SpeechToText, StructuredPrompt, TextToSpeech,
};
use wren::{AssistantPipeline, ConversationMode, Result};

/// Audio source fed from a test channel. The stream stays open until the
/// sender is dropped, which ends the source gracefully.
struct ScriptedSource {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl AudioSource for ScriptedSource {
    async fn next_buffer(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }
}

/// STT double returning a fixed transcript for every segment.
struct FixedStt {
    text: String,
    calls: Mutex<u32>,
}

#[async_trait]
impl SpeechToText for FixedStt {
    async fn transcribe(&self, _wav: &[u8]) -> Result<String> {
        *self.calls.lock().unwrap() += 1;
        Ok(self.text.clone())
    }
}

/// LLM double echoing a fixed reply and recording prompts.
struct FixedLlm {
    reply: String,
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl LanguageModel for FixedLlm {
    async fn get_response(
        &self,
        prompt: &StructuredPrompt,
        _cancel: &CancellationToken,
    ) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.user.content.clone());
        Ok(self.reply.clone())
    }
}

/// TTS double recording what it was asked to speak.
struct RecordingTts {
    spoken: Mutex<Vec<String>>,
}

#[async_trait]
impl TextToSpeech for RecordingTts {
    async fn speak_default(&self, text: &str, _cancel: &CancellationToken) -> Result<()> {
        self.spoken.lock().unwrap().push(text.to_owned());
        Ok(())
    }
}

/// Small, fast segmenter geometry: 1kHz, 10ms frames (10 samples each).
fn test_config(storage_root: &std::path::Path) -> AssistantConfig {
    AssistantConfig {
        segmenter: SegmenterConfig {
            sample_rate: 1000,
            channels: 1,
            frame_ms: 10,
            enter_rms: 0.1,
            enter_active_ratio: 0.9,
            enter_consecutive: 2,
            exit_rms: 0.05,
            exit_active_ratio: 0.5,
            exit_consecutive: 3,
            prepend_padding_ms: 20,
            append_padding_ms: 20,
            min_segment_ms: 40,
            max_segment_ms: 2_000,
            active_sample_abs_threshold: 0.02,
            burst_enter_rms: 0.0,
            burst_peak_abs_threshold: 0.0,
            burst_window_ms: 0,
            burst_min_segment_ms: 0,
            burst_quiet_consecutive: 10,
            use_adaptive_thresholds: false,
            noise_floor_alpha: 0.05,
            noise_floor_enter_multiplier: 3.0,
            noise_floor_exit_multiplier: 2.0,
            enable_metrics: false,
            metrics_interval_ms: 1_000,
        },
        host: HostConfig {
            wake_word: "wren".to_owned(),
            processing_silence_seconds: 0.05,
            end_silence_seconds: 30.0,
            audio_queue_capacity: 16,
            transcription_queue_capacity: 64,
            ticker_interval_ms: 10,
            suppression_tail_grace_ms: 50,
        },
        context: ContextConfig {
            storage_root: Some(storage_root.to_path_buf()),
            encryption_key: "integration-test-key".to_owned(),
            ..ContextConfig::default()
        },
        stt: SttConfig::default(),
    }
}

fn frame_bytes(amplitude: i16) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(20);
    for _ in 0..10 {
        bytes.extend_from_slice(&amplitude.to_le_bytes());
    }
    bytes
}

/// One utterance worth of PCM: silence to fill pre-roll, speech, then
/// enough quiet to satisfy the exit streak.
async fn send_utterance(tx: &mpsc::Sender<Vec<u8>>) {
    for _ in 0..4 {
        tx.send(frame_bytes(0)).await.expect("source open");
    }
    for _ in 0..8 {
        tx.send(frame_bytes(16384)).await.expect("source open");
    }
    for _ in 0..4 {
        tx.send(frame_bytes(0)).await.expect("source open");
    }
}

/// Poll until `check` passes or the timeout elapses.
async fn wait_for(mut check: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}",
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn spoken_question_becomes_a_stored_conversation_turn() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (audio_tx, audio_rx) = mpsc::channel(64);

    let stt = Arc::new(FixedStt {
        text: "hey wren what time is it".to_owned(),
        calls: Mutex::new(0),
    });
    let llm = Arc::new(FixedLlm {
        reply: "it is just past noon".to_owned(),
        prompts: Mutex::new(Vec::new()),
    });

    let pipeline = AssistantPipeline::new(
        test_config(tmp.path()),
        Box::new(ScriptedSource { rx: audio_rx }),
        Arc::clone(&stt) as Arc<dyn SpeechToText>,
        Arc::clone(&llm) as Arc<dyn LanguageModel>,
        None,
    )
    .expect("pipeline builds");

    let fsm = pipeline.fsm();
    let store = pipeline.store();
    let cancel = pipeline.cancellation_token();
    let runner = tokio::spawn(pipeline.run());

    send_utterance(&audio_tx).await;

    // Wake word reaches the FSM, then the silence timer composes a prompt
    // and the orchestrator completes the turn back to Listening.
    wait_for(|| *stt.calls.lock().unwrap() > 0, "the ASR call").await;
    wait_for(
        || store.tail(10).map(|t| t.len() >= 2).unwrap_or(false),
        "both conversation messages",
    )
    .await;

    let tail = store.tail(10).expect("tail");
    assert_eq!(tail[0].role, ChatRole::User);
    assert_eq!(tail[0].content, "hey wren what time is it");
    assert_eq!(tail[1].role, ChatRole::Assistant);
    assert_eq!(tail[1].content, "it is just past noon");
    assert_eq!(
        llm.prompts.lock().unwrap().clone(),
        vec!["hey wren what time is it".to_owned()],
    );

    wait_for(
        || fsm.mode() == ConversationMode::Listening,
        "the FSM to return to Listening",
    )
    .await;

    cancel.cancel();
    runner.await.expect("join").expect("pipeline run");
}

#[tokio::test]
async fn tts_reply_cycles_through_speaking() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (audio_tx, audio_rx) = mpsc::channel(64);

    let stt = Arc::new(FixedStt {
        text: "wren say something".to_owned(),
        calls: Mutex::new(0),
    });
    let llm = Arc::new(FixedLlm {
        reply: "something".to_owned(),
        prompts: Mutex::new(Vec::new()),
    });
    let tts = Arc::new(RecordingTts {
        spoken: Mutex::new(Vec::new()),
    });

    let pipeline = AssistantPipeline::new(
        test_config(tmp.path()),
        Box::new(ScriptedSource { rx: audio_rx }),
        Arc::clone(&stt) as Arc<dyn SpeechToText>,
        Arc::clone(&llm) as Arc<dyn LanguageModel>,
        Some(Arc::clone(&tts) as Arc<dyn TextToSpeech>),
    )
    .expect("pipeline builds");

    let mut events = pipeline.subscribe_events();
    let cancel = pipeline.cancellation_token();
    let runner = tokio::spawn(pipeline.run());

    send_utterance(&audio_tx).await;

    wait_for(
        || !tts.spoken.lock().unwrap().is_empty(),
        "the reply to be spoken",
    )
    .await;
    assert_eq!(tts.spoken.lock().unwrap().clone(), vec!["something".to_owned()]);

    // The event stream shows the full turn, Speaking included.
    let mut modes = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let FsmEvent::StateChanged { to, .. } = event {
            modes.push(to);
        }
    }
    assert!(modes.contains(&ConversationMode::Listening));
    assert!(modes.contains(&ConversationMode::Processing));
    assert!(modes.contains(&ConversationMode::Speaking));

    cancel.cancel();
    runner.await.expect("join").expect("pipeline run");
}

#[tokio::test]
async fn closing_the_source_ends_the_pipeline_gracefully() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (audio_tx, audio_rx) = mpsc::channel(64);

    let stt = Arc::new(FixedStt {
        text: String::new(),
        calls: Mutex::new(0),
    });
    let llm = Arc::new(FixedLlm {
        reply: String::new(),
        prompts: Mutex::new(Vec::new()),
    });

    let pipeline = AssistantPipeline::new(
        test_config(tmp.path()),
        Box::new(ScriptedSource { rx: audio_rx }),
        stt as Arc<dyn SpeechToText>,
        llm as Arc<dyn LanguageModel>,
        None,
    )
    .expect("pipeline builds");

    let runner = tokio::spawn(pipeline.run());

    audio_tx.send(frame_bytes(0)).await.expect("source open");
    drop(audio_tx);

    // No cancellation: the ended source alone winds the pipeline down.
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("pipeline ends on its own")
        .expect("join")
        .expect("pipeline run");
}

#[tokio::test]
async fn cancellation_stops_an_idle_pipeline() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (_audio_tx, audio_rx) = mpsc::channel(64);

    let stt = Arc::new(FixedStt {
        text: String::new(),
        calls: Mutex::new(0),
    });
    let llm = Arc::new(FixedLlm {
        reply: String::new(),
        prompts: Mutex::new(Vec::new()),
    });

    let pipeline = AssistantPipeline::new(
        test_config(tmp.path()),
        Box::new(ScriptedSource { rx: audio_rx }),
        stt as Arc<dyn SpeechToText>,
        llm as Arc<dyn LanguageModel>,
        None,
    )
    .expect("pipeline builds");

    let cancel = pipeline.cancellation_token();
    let runner = tokio::spawn(pipeline.run());

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("pipeline stops on cancel")
        .expect("join")
        .expect("pipeline run");
}
