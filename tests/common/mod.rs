//! Shared test utilities
//!
//! Hardware-free stand-ins for the microphone, the speaker, the wake word
//! engine and the backend. The recorder and the wake engine share one
//! [`MicLog`] and panic if they ever run at the same time.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use karuna::backend::{Greeting, Transcription, VoiceAnswer};
use karuna::config::ConversationConfig;
use karuna::conversation::{ConversationController, ConversationState, OverlayView};
use karuna::voice::{
    AudioPlayer, AudioSink, AudioSource, Completion, Detection, KeywordEngine, Recorder,
    WakeWordDetector,
};
use karuna::{Backend, Error, Result, SessionId, TranscriptBridge};
use tokio::sync::{Notify, mpsc, watch};

/// Audio reference the mock backend hands out
pub const ANSWER_AUDIO: &str = "data:audio/mp3;base64,SUQzBA==";

/// Ordered record of microphone and speaker activity
#[derive(Clone, Default)]
pub struct MicLog {
    events: Arc<Mutex<Vec<&'static str>>>,
    wake_listening: Arc<AtomicBool>,
    recording: Arc<AtomicBool>,
}

impl MicLog {
    fn push(&self, event: &'static str) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| **e == event).count()
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    pub fn is_wake_listening(&self) -> bool {
        self.wake_listening.load(Ordering::SeqCst)
    }
}

/// How the mock recorder behaves on start
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum RecorderMode {
    /// Record and return a small WAV blob
    Records,
    /// Record nothing
    Silent,
    /// Refuse with a permission error
    Denied,
}

pub struct MockRecorder {
    log: MicLog,
    mode: RecorderMode,
}

impl MockRecorder {
    pub fn new(log: &MicLog, mode: RecorderMode) -> Self {
        Self {
            log: log.clone(),
            mode,
        }
    }
}

impl Recorder for MockRecorder {
    fn start(&mut self) -> Result<()> {
        assert!(
            !self.log.is_wake_listening(),
            "recorder started while the wake word was listening"
        );
        self.log.push("recorder.start");
        if self.mode == RecorderMode::Denied {
            return Err(Error::MicPermission("access denied".to_string()));
        }
        self.log.recording.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Option<Vec<u8>> {
        if !self.log.recording.swap(false, Ordering::SeqCst) {
            return None;
        }
        self.log.push("recorder.stop");
        match self.mode {
            RecorderMode::Records => Some(b"RIFF....WAVE".to_vec()),
            RecorderMode::Silent | RecorderMode::Denied => None,
        }
    }

    fn is_capturing(&self) -> bool {
        self.log.is_recording()
    }
}

/// Handle to fire wake detections into a listening [`MockEngine`]
#[derive(Clone, Default)]
pub struct WakeTrigger {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<Detection>>>>,
}

impl WakeTrigger {
    /// Deliver a detection; returns false if the engine is not listening
    pub fn fire(&self) -> bool {
        self.tx.lock().unwrap().as_ref().is_some_and(|tx| {
            tx.send(Detection {
                label: "Hey Karuna".to_string(),
                transcript: "hey karuna".to_string(),
                at: Utc::now(),
            })
            .is_ok()
        })
    }
}

pub struct MockEngine {
    log: MicLog,
    trigger: WakeTrigger,
    fail_start: bool,
}

impl MockEngine {
    pub fn new(log: &MicLog, trigger: &WakeTrigger) -> Self {
        Self {
            log: log.clone(),
            trigger: trigger.clone(),
            fail_start: false,
        }
    }

    pub fn failing(log: &MicLog) -> Self {
        Self {
            log: log.clone(),
            trigger: WakeTrigger::default(),
            fail_start: true,
        }
    }
}

impl KeywordEngine for MockEngine {
    fn start(&mut self, detections: mpsc::UnboundedSender<Detection>) -> Result<()> {
        assert!(
            !self.log.is_recording(),
            "wake word started while the recorder was running"
        );
        if self.fail_start {
            return Err(Error::Audio("no input device".to_string()));
        }
        self.log.push("wake.start");
        self.log.wake_listening.store(true, Ordering::SeqCst);
        *self.trigger.tx.lock().unwrap() = Some(detections);
        Ok(())
    }

    fn stop(&mut self) {
        self.log.push("wake.stop");
        self.log.wake_listening.store(false, Ordering::SeqCst);
        *self.trigger.tx.lock().unwrap() = None;
    }
}

/// Speaker that "plays" for a fixed stretch of (virtual) time
#[derive(Clone)]
pub struct MockSink {
    log: MicLog,
    length: Duration,
    pub plays: Arc<AtomicUsize>,
}

impl MockSink {
    pub fn new(log: &MicLog, length: Duration) -> Self {
        Self {
            log: log.clone(),
            length,
            plays: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl AudioSink for MockSink {
    fn start(&mut self, _source: &AudioSource, done: Completion) -> Result<()> {
        self.log.push("speaker.start");
        self.plays.fetch_add(1, Ordering::SeqCst);
        let length = self.length;
        tokio::spawn(async move {
            tokio::time::sleep(length).await;
            done();
        });
        Ok(())
    }

    fn halt(&mut self) {
        self.log.push("speaker.halt");
    }
}

/// Scripted `/transcribe` reply
#[derive(Clone)]
pub enum Reply {
    Heard(&'static str),
    NotHeard,
    Fail,
}

/// Scripted backend that records which session each call carried
#[derive(Default)]
pub struct MockBackend {
    greeting_audio: Option<String>,
    greeting_fails: bool,
    transcripts: Mutex<VecDeque<Reply>>,
    answer: Option<(String, Option<String>)>,
    answer_gate: Option<Arc<Notify>>,
    pub answer_started: Arc<Notify>,
    calls: Mutex<Vec<(&'static str, String)>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn greeting_audio(mut self, audio: &str) -> Self {
        self.greeting_audio = Some(audio.to_string());
        self
    }

    pub fn greeting_fails(mut self) -> Self {
        self.greeting_fails = true;
        self
    }

    pub fn transcripts(self, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.transcripts.lock().unwrap().extend(replies);
        self
    }

    pub fn answer(mut self, text: &str, audio: Option<&str>) -> Self {
        self.answer = Some((text.to_string(), audio.map(ToString::to_string)));
        self
    }

    /// Hold every `/chat-voice` call until `gate` is notified
    pub fn gated(mut self, gate: &Arc<Notify>) -> Self {
        self.answer_gate = Some(Arc::clone(gate));
        self
    }

    fn record(&self, endpoint: &'static str, session: &SessionId) {
        self.calls
            .lock()
            .unwrap()
            .push((endpoint, session.as_str().to_string()));
    }

    pub fn count(&self, endpoint: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| *e == endpoint)
            .count()
    }

    pub fn sessions(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, s)| s.clone())
            .collect()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn greeting(&self, session: &SessionId) -> Result<Greeting> {
        self.record("greeting", session);
        if self.greeting_fails {
            return Err(Error::Backend("/greeting returned 502".to_string()));
        }
        Ok(Greeting {
            text: None,
            audio: self.greeting_audio.clone(),
        })
    }

    async fn transcribe(&self, _audio: Vec<u8>, session: &SessionId) -> Result<Transcription> {
        self.record("transcribe", session);
        let reply = self
            .transcripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::NotHeard);
        match reply {
            Reply::Heard(text) => Ok(Transcription::Heard(text.to_string())),
            Reply::NotHeard => Ok(Transcription::NotHeard("empty transcript".to_string())),
            Reply::Fail => Err(Error::Backend("/transcribe returned 500".to_string())),
        }
    }

    async fn chat_voice(&self, _text: &str, session: &SessionId) -> Result<VoiceAnswer> {
        self.record("chat_voice", session);
        self.answer_started.notify_one();
        if let Some(gate) = &self.answer_gate {
            gate.notified().await;
        }
        match &self.answer {
            Some((answer, audio)) => Ok(VoiceAnswer {
                answer: answer.clone(),
                audio: audio.clone(),
            }),
            None => Err(Error::Backend("/chat-voice returned 500".to_string())),
        }
    }

    async fn chat(&self, question: &str, session: &SessionId) -> Result<String> {
        self.record("chat", session);
        Ok(format!("You asked: {question}"))
    }
}

/// A controller wired to mocks, plus handles to observe it
pub struct Harness {
    pub controller: ConversationController,
    pub backend: Arc<MockBackend>,
    pub log: MicLog,
    pub sink: MockSink,
    pub transcript: TranscriptBridge,
    pub view: watch::Receiver<OverlayView>,
    pub trigger: WakeTrigger,
}

pub struct HarnessBuilder {
    backend: MockBackend,
    config: ConversationConfig,
    recorder: RecorderMode,
    wake: Option<bool>,
    playback: Duration,
}

impl HarnessBuilder {
    pub fn new(backend: MockBackend) -> Self {
        Self {
            backend,
            config: ConversationConfig::default(),
            recorder: RecorderMode::Records,
            wake: Some(true),
            playback: Duration::from_secs(2),
        }
    }

    pub fn recorder(mut self, mode: RecorderMode) -> Self {
        self.recorder = mode;
        self
    }

    pub fn max_retries(mut self, max: Option<u32>) -> Self {
        self.config.max_retries = max;
        self
    }

    pub fn without_wake_word(mut self) -> Self {
        self.wake = None;
        self
    }

    pub fn failing_wake_word(mut self) -> Self {
        self.wake = Some(false);
        self
    }

    pub fn build(self) -> Harness {
        let log = MicLog::default();
        let trigger = WakeTrigger::default();
        let sink = MockSink::new(&log, self.playback);
        let backend = Arc::new(self.backend);
        let transcript = TranscriptBridge::new();

        let mut controller = ConversationController::new(
            &self.config,
            Arc::clone(&backend) as Arc<dyn Backend>,
            Box::new(MockRecorder::new(&log, self.recorder)),
            AudioPlayer::new(Box::new(sink.clone())),
            SessionId::current().clone(),
            transcript.clone(),
        );

        match self.wake {
            Some(true) => {
                let engine = MockEngine::new(&log, &trigger);
                controller = controller.with_wake_word(WakeWordDetector::new(Box::new(engine)));
            }
            Some(false) => {
                let engine = MockEngine::failing(&log);
                controller = controller.with_wake_word(WakeWordDetector::new(Box::new(engine)));
            }
            None => {}
        }

        let view = controller.subscribe();
        Harness {
            controller,
            backend,
            log,
            sink,
            transcript,
            view,
            trigger,
        }
    }
}

/// Generous bound in virtual time; a stuck flow fails instead of hanging
const WAIT_LIMIT: Duration = Duration::from_secs(120);

/// Wait until the overlay shows `state`
pub async fn wait_for_state(view: &mut watch::Receiver<OverlayView>, state: ConversationState) {
    let reached = tokio::time::timeout(WAIT_LIMIT, view.wait_for(|v| v.state == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .is_ok();
    assert!(reached, "controller stopped before reaching {state}");
}

/// Poll `condition` until it holds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT_LIMIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition never held");
}
