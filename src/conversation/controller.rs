//! Conversation controller
//!
//! Runs the [`Machine`] on a single task and carries out its effects. Audio
//! devices stay on this task; network calls, timers and playback report back
//! through an unbounded channel as [`Event::Continue`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use url::Url;

use super::machine::{ConversationState, Effect, Event, LivenessToken, Machine, Outcome};
use super::view::{Notice, OverlayView};
use crate::Result;
use crate::backend::{Backend, Transcription};
use crate::config::ConversationConfig;
use crate::session::SessionId;
use crate::transcript::{TranscriptBridge, Turn};
use crate::voice::{
    AudioPlayer, AudioSource, Detection, MicArbiter, MicOwner, Recorder, WakeWordDetector,
};

/// How often buffered wake word audio is processed
const WAKE_PUMP_INTERVAL: Duration = Duration::from_millis(100);

/// User controls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Open a conversation
    Open,
    /// Pause the conversation
    Pause,
    /// Resume a paused conversation
    Resume,
    /// Open, pause or resume depending on the state
    Toggle,
    /// End the conversation
    Close,
    /// Stop the controller
    Shutdown,
}

/// Owns the microphone, the player and the conversation state
pub struct ConversationController {
    machine: Machine,
    arbiter: MicArbiter,
    wake: Option<WakeWordDetector>,
    recorder: Box<dyn Recorder>,
    player: AudioPlayer,
    backend: Arc<dyn Backend>,
    session: SessionId,
    transcript: TranscriptBridge,
    view: watch::Sender<OverlayView>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

impl ConversationController {
    /// Create an idle controller without passive wake word listening
    #[must_use]
    pub fn new(
        config: &ConversationConfig,
        backend: Arc<dyn Backend>,
        recorder: Box<dyn Recorder>,
        player: AudioPlayer,
        session: SessionId,
        transcript: TranscriptBridge,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (view, _) = watch::channel(OverlayView::default());

        Self {
            machine: Machine::new(config),
            arbiter: MicArbiter::new(),
            wake: None,
            recorder,
            player,
            backend,
            session,
            transcript,
            view,
            events_tx,
            events_rx,
        }
    }

    /// Listen for the wake word whenever no conversation holds the microphone
    #[must_use]
    pub fn with_wake_word(mut self, detector: WakeWordDetector) -> Self {
        self.wake = Some(detector);
        self
    }

    /// Take the wake word detector if its engine initialized
    ///
    /// An engine that failed to initialize leaves manual controls working and
    /// shows [`Notice::WakeWordUnavailable`] once.
    #[must_use]
    pub fn with_wake_word_init(self, init: Result<WakeWordDetector>) -> Self {
        match init {
            Ok(detector) => self.with_wake_word(detector),
            Err(e) => {
                tracing::warn!(error = %e, "wake word engine failed to initialize");
                self.notify(Notice::WakeWordUnavailable(e.to_string()));
                self
            }
        }
    }

    /// Show a persistent notice
    pub fn notify(&self, notice: Notice) {
        tracing::warn!(%notice, "notice");
        self.view.send_modify(|v| v.notice = Some(notice));
    }

    /// Watch the overlay
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<OverlayView> {
        self.view.subscribe()
    }

    /// Current conversation state
    #[must_use]
    pub const fn state(&self) -> ConversationState {
        self.machine.state()
    }

    /// Current microphone holder
    #[must_use]
    pub const fn mic_owner(&self) -> MicOwner {
        self.arbiter.current_owner()
    }

    /// Run until [`Command::Shutdown`] or the command channel closes
    ///
    /// # Errors
    ///
    /// Recoverable failures are handled inside the loop; this currently
    /// always returns `Ok`
    #[allow(clippy::future_not_send)]
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> Result<()> {
        self.arm_wake_word();

        let mut pump = tokio::time::interval(WAKE_PUMP_INTERVAL);
        pump.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let pumping = self.wake.is_some();

        tracing::info!(wake_word = pumping, "conversation controller running");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.command(command),
                },
                Some(event) = self.events_rx.recv() => self.dispatch(event),
                Some(detection) = next_detection(self.wake.as_mut()) => {
                    self.on_detection(&detection);
                }
                _ = pump.tick(), if pumping => {
                    if let Some(wake) = self.wake.as_mut() {
                        wake.pump();
                    }
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    fn command(&mut self, command: Command) {
        tracing::debug!(?command, state = %self.machine.state(), "command");

        let event = match command {
            Command::Open => Event::Open,
            Command::Pause => Event::Pause,
            Command::Resume => Event::Resume,
            Command::Close => Event::Close,
            Command::Toggle => match self.machine.state() {
                ConversationState::Idle => Event::Open,
                ConversationState::Paused => Event::Resume,
                _ => Event::Pause,
            },
            Command::Shutdown => return,
        };
        self.dispatch(event);
    }

    fn on_detection(&mut self, detection: &Detection) {
        let event = match self.machine.state() {
            ConversationState::Idle => Event::Open,
            ConversationState::Paused => Event::Resume,
            state => {
                tracing::trace!(%state, "wake word ignored during conversation");
                return;
            }
        };

        tracing::info!(label = %detection.label, transcript = %detection.transcript, "wake word");
        self.dispatch(event);
    }

    /// Feed an event and everything it triggers synchronously
    fn dispatch(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            let effects = self.machine.handle(event);
            let token = self.machine.token();

            for effect in effects {
                let Some(outcome) = self.execute(effect, token) else {
                    continue;
                };
                // Nothing else in the batch may run without the microphone
                let abort = matches!(outcome, Outcome::MicUnavailable(_));
                queue.push_back(Event::Continue(token, outcome));
                if abort {
                    break;
                }
            }

            let state = self.machine.state();
            self.view.send_if_modified(|v| {
                let changed = v.state != state;
                v.state = state;
                changed
            });
        }
    }

    /// Run one effect; returns an outcome that is known immediately
    fn execute(&mut self, effect: Effect, token: LivenessToken) -> Option<Outcome> {
        match effect {
            Effect::AcquireMic => self
                .acquire_mic()
                .err()
                .map(|e| Outcome::MicUnavailable(e.to_string())),
            Effect::ReleaseMic => {
                self.release_mic();
                None
            }
            Effect::FetchGreeting => {
                let backend = Arc::clone(&self.backend);
                let session = self.session.clone();
                self.spawn(token, async move {
                    match backend.greeting(&session).await {
                        Ok(greeting) => Outcome::GreetingFetched {
                            audio: parse_audio(greeting.audio.as_deref()),
                            text: greeting.text,
                        },
                        Err(e) => {
                            tracing::warn!(error = %e, "greeting failed");
                            Outcome::GreetingFailed
                        }
                    }
                });
                None
            }
            Effect::Play(url) => self.play(url, token),
            Effect::StopPlayback => {
                self.player.stop();
                None
            }
            Effect::StartCapture => Some(match self.recorder.start() {
                Ok(()) => Outcome::CaptureStarted,
                Err(e) => Outcome::CaptureFailed {
                    permanent: e.is_permanent_capture_failure(),
                    reason: e.to_string(),
                },
            }),
            Effect::FinishCapture => Some(Outcome::Captured(self.recorder.stop())),
            Effect::DiscardCapture => {
                drop(self.recorder.stop());
                None
            }
            Effect::Schedule { delay, then } => {
                self.spawn(token, async move {
                    tokio::time::sleep(delay).await;
                    then
                });
                None
            }
            Effect::Transcribe(blob) => {
                let backend = Arc::clone(&self.backend);
                let session = self.session.clone();
                self.spawn(token, async move {
                    match backend.transcribe(blob, &session).await {
                        Ok(Transcription::Heard(text)) => Outcome::Transcribed(Some(text)),
                        Ok(Transcription::NotHeard(reason)) => {
                            tracing::debug!(%reason, "nothing heard");
                            Outcome::Transcribed(None)
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "transcription failed");
                            Outcome::TranscriptionFailed
                        }
                    }
                });
                None
            }
            Effect::Answer(text) => {
                let backend = Arc::clone(&self.backend);
                let session = self.session.clone();
                self.spawn(token, async move {
                    match backend.chat_voice(&text, &session).await {
                        Ok(answer) => Outcome::Answered {
                            audio: parse_audio(answer.audio.as_deref()),
                            answer: answer.answer,
                        },
                        Err(e) => {
                            tracing::warn!(error = %e, "answer failed");
                            Outcome::AnswerFailed
                        }
                    }
                });
                None
            }
            Effect::EmitTurn {
                user_text,
                assistant_text,
                audio,
            } => {
                self.transcript
                    .append(Turn::new(user_text, assistant_text, audio));
                None
            }
            Effect::Caption(caption) => {
                self.view.send_modify(|v| v.caption = caption);
                None
            }
            Effect::Notify(notice) => {
                self.notify(notice);
                None
            }
            Effect::ClearNotice => {
                self.view.send_if_modified(|v| v.notice.take().is_some());
                None
            }
        }
    }

    /// Start playback; a source that cannot be played counts as ended
    fn play(&mut self, url: Url, token: LivenessToken) -> Option<Outcome> {
        let source = match AudioSource::try_from(url) {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!(error = %e, "unplayable audio");
                return Some(Outcome::PlaybackEnded);
            }
        };

        let events = self.events_tx.clone();
        self.player.load(source);
        self.player.on_complete(move || {
            let _ = events.send(Event::Continue(token, Outcome::PlaybackEnded));
        });

        match self.player.play() {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(error = %e, "playback did not start");
                Some(Outcome::PlaybackEnded)
            }
        }
    }

    /// Run `work` in the background and report its outcome under `token`
    fn spawn<F>(&self, token: LivenessToken, work: F)
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = work.await;
            // Receiver only goes away on shutdown
            let _ = events.send(Event::Continue(token, outcome));
        });
    }

    /// Stop the wake word, then take the microphone for the conversation
    fn acquire_mic(&mut self) -> Result<()> {
        if let Some(wake) = self.wake.as_mut() {
            wake.stop();
        }
        self.arbiter.release(MicOwner::WakeWord);
        self.arbiter.acquire(MicOwner::VoiceMode)
    }

    /// Give the microphone back, then restart the wake word
    fn release_mic(&mut self) {
        drop(self.recorder.stop());
        self.arbiter.release(MicOwner::VoiceMode);
        self.arm_wake_word();
    }

    fn arm_wake_word(&mut self) {
        let Some(wake) = self.wake.as_mut() else {
            return;
        };
        if wake.is_listening() {
            return;
        }
        if let Err(e) = self.arbiter.acquire(MicOwner::WakeWord) {
            tracing::debug!(error = %e, "wake word not armed");
            return;
        }

        if let Err(e) = wake.start(&self.arbiter) {
            tracing::warn!(error = %e, "wake word listening failed to start");
            self.arbiter.release(MicOwner::WakeWord);
            self.wake = None;
            self.notify(Notice::WakeWordUnavailable(e.to_string()));
        } else {
            tracing::info!("listening for wake word");
        }
    }

    fn shutdown(&mut self) {
        self.player.stop();
        drop(self.recorder.stop());
        self.arbiter.release(MicOwner::VoiceMode);
        if let Some(wake) = self.wake.as_mut() {
            wake.stop();
        }
        self.arbiter.release(MicOwner::WakeWord);
        tracing::info!("conversation controller stopped");
    }
}

async fn next_detection(wake: Option<&mut WakeWordDetector>) -> Option<Detection> {
    match wake {
        Some(wake) => wake.next_detection().await,
        None => std::future::pending().await,
    }
}

fn parse_audio(reference: Option<&str>) -> Option<Url> {
    let reference = reference.map(str::trim).filter(|r| !r.is_empty())?;
    match AudioSource::parse(reference) {
        Ok(source) => Some(source.url().clone()),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring unusable audio reference");
            None
        }
    }
}
