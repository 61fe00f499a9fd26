//! Conversation state machine
//!
//! Pure transition logic: [`Machine::handle`] maps an event to the effects the
//! controller must carry out. Every asynchronous result comes back as
//! [`Event::Continue`] tagged with the [`LivenessToken`] current when the work
//! was started; pause and close bump the token so late results are dropped.

use std::fmt;
use std::time::Duration;

use url::Url;

use super::view::Notice;
use crate::config::{ConversationConfig, Timings};

/// Caption shown when the backend could not make out speech
pub const NOT_HEARD: &str = "I didn't catch that.";

/// Caption shown when a backend call failed
pub const CONNECTION_ERROR: &str = "Connection Error.";

/// Caption shown when the microphone failed to open
pub const MIC_ERROR: &str = "Microphone error.";

/// Conversation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationState {
    /// Not in a conversation; wake word listening
    #[default]
    Idle,
    /// Fetching or playing the greeting
    Greeting,
    /// Recording the user
    Listening,
    /// Transcribing and fetching the answer
    Thinking,
    /// Playing the answer
    Speaking,
    /// Suspended by the user or a persistent failure
    Paused,
    /// Waiting to recover from a failed call
    Error,
}

impl ConversationState {
    /// Whether a conversation is running (neither idle nor paused)
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Paused)
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Greeting => "greeting",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Paused => "paused",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Generation of the current open lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LivenessToken(u64);

impl LivenessToken {
    const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// Input to the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Start a conversation
    Open,
    /// Suspend the conversation
    Pause,
    /// Continue a paused conversation
    Resume,
    /// End the conversation
    Close,
    /// Result of work started under `token`
    Continue(LivenessToken, Outcome),
}

/// Result of an effect, fed back as [`Event::Continue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Greeting arrived
    GreetingFetched {
        /// Greeting text, if any
        text: Option<String>,
        /// Greeting audio, if any
        audio: Option<Url>,
    },
    /// Greeting request failed
    GreetingFailed,
    /// Audio finished (or failed to play)
    PlaybackEnded,
    /// Recorder is running
    CaptureStarted,
    /// Recorder could not start
    CaptureFailed {
        /// Whether retrying can never succeed
        permanent: bool,
        /// Device message
        reason: String,
    },
    /// The microphone could not be acquired
    MicUnavailable(String),
    /// The capture window is over
    WindowElapsed,
    /// Recorder stopped; the blob if anything was recorded
    Captured(Option<Vec<u8>>),
    /// Transcription answered; `None` when nothing was heard
    Transcribed(Option<String>),
    /// Transcription request failed
    TranscriptionFailed,
    /// Answer arrived
    Answered {
        /// Full answer text
        answer: String,
        /// Spoken answer, if any
        audio: Option<Url>,
    },
    /// Answer request failed
    AnswerFailed,
    /// A backoff is over; start listening again
    ResumeListening,
}

/// Work the controller performs on behalf of the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Hand the microphone from the wake word to the conversation
    AcquireMic,
    /// Hand the microphone back to the wake word
    ReleaseMic,
    /// Request the greeting
    FetchGreeting,
    /// Play audio; reports [`Outcome::PlaybackEnded`]
    Play(Url),
    /// Halt playback and drop its completion
    StopPlayback,
    /// Open the recorder; reports `CaptureStarted` or `CaptureFailed`
    StartCapture,
    /// Stop the recorder; reports [`Outcome::Captured`]
    FinishCapture,
    /// Stop the recorder and throw the audio away
    DiscardCapture,
    /// Deliver `then` after `delay`
    Schedule {
        /// How long to wait
        delay: Duration,
        /// What to deliver
        then: Outcome,
    },
    /// Send the blob to the backend for transcription
    Transcribe(Vec<u8>),
    /// Ask the backend to answer `text`
    Answer(String),
    /// Append a completed turn to the transcript
    EmitTurn {
        /// What the user said
        user_text: String,
        /// What the assistant answered
        assistant_text: String,
        /// Answer audio
        audio: Option<Url>,
    },
    /// Replace the caption
    Caption(String),
    /// Show a persistent notice
    Notify(Notice),
    /// Remove the persistent notice
    ClearNotice,
}

/// The conversation state machine
#[derive(Debug)]
pub struct Machine {
    state: ConversationState,
    liveness: LivenessToken,
    capturing: bool,
    pending_user_text: Option<String>,
    failures: u32,
    max_retries: Option<u32>,
    timings: Timings,
}

impl Machine {
    /// Create an idle machine
    #[must_use]
    pub const fn new(config: &ConversationConfig) -> Self {
        Self {
            state: ConversationState::Idle,
            liveness: LivenessToken(0),
            capturing: false,
            pending_user_text: None,
            failures: 0,
            max_retries: config.max_retries,
            timings: config.timings,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> ConversationState {
        self.state
    }

    /// Token continuations must carry to be applied
    #[must_use]
    pub const fn token(&self) -> LivenessToken {
        self.liveness
    }

    /// Whether the recorder is supposed to be running
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.capturing
    }

    /// Apply an event and return the effects to run, in order
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        let before = self.state;
        let effects = match event {
            Event::Open => self.open(),
            Event::Pause => self.pause(),
            Event::Resume => self.resume(),
            Event::Close => self.close(),
            Event::Continue(token, outcome) => {
                if token != self.liveness {
                    tracing::trace!(?outcome, "stale continuation dropped");
                    return Vec::new();
                }
                self.advance(outcome)
            }
        };

        if self.state != before {
            tracing::debug!(from = %before, to = %self.state, "conversation transition");
        }
        effects
    }

    fn open(&mut self) -> Vec<Effect> {
        if self.state != ConversationState::Idle {
            return Vec::new();
        }
        self.invalidate();
        self.failures = 0;
        self.state = ConversationState::Greeting;
        vec![
            Effect::AcquireMic,
            Effect::ClearNotice,
            Effect::Caption(String::new()),
            Effect::FetchGreeting,
        ]
    }

    fn pause(&mut self) -> Vec<Effect> {
        if !self.state.is_active() {
            return Vec::new();
        }
        self.invalidate();
        self.state = ConversationState::Paused;
        self.teardown()
    }

    fn resume(&mut self) -> Vec<Effect> {
        if self.state != ConversationState::Paused {
            return Vec::new();
        }
        self.invalidate();
        self.failures = 0;
        self.state = ConversationState::Listening;
        vec![
            Effect::AcquireMic,
            Effect::ClearNotice,
            Effect::StartCapture,
        ]
    }

    fn close(&mut self) -> Vec<Effect> {
        if self.state == ConversationState::Idle {
            return Vec::new();
        }
        self.invalidate();
        self.state = ConversationState::Idle;
        let mut effects = self.teardown();
        effects.push(Effect::Caption(String::new()));
        effects.push(Effect::ClearNotice);
        effects
    }

    #[allow(clippy::too_many_lines)]
    fn advance(&mut self, outcome: Outcome) -> Vec<Effect> {
        use ConversationState as S;

        match (self.state, outcome) {
            (_, Outcome::MicUnavailable(reason)) if self.state.is_active() => {
                self.halt(Notice::MicrophoneBusy(reason))
            }

            (S::Greeting, Outcome::GreetingFetched { text, audio }) => {
                let mut effects: Vec<Effect> = text
                    .filter(|t| !t.trim().is_empty())
                    .map(Effect::Caption)
                    .into_iter()
                    .collect();
                match audio {
                    Some(url) => effects.push(Effect::Play(url)),
                    None => effects.extend(self.listen()),
                }
                effects
            }
            (S::Greeting, Outcome::PlaybackEnded) => self.listen(),
            (S::Greeting, Outcome::GreetingFailed) => self.fail(CONNECTION_ERROR),

            (S::Listening, Outcome::CaptureStarted) if !self.capturing => {
                self.capturing = true;
                vec![
                    Effect::Caption(String::new()),
                    Effect::Schedule {
                        delay: self.timings.capture_window,
                        then: Outcome::WindowElapsed,
                    },
                ]
            }
            (S::Listening, Outcome::CaptureFailed { permanent, reason }) => {
                if permanent {
                    tracing::warn!(%reason, "microphone permanently unavailable");
                    self.halt(Notice::MicrophoneDenied(reason))
                } else {
                    tracing::warn!(%reason, "capture failed");
                    self.fail(MIC_ERROR)
                }
            }
            (S::Listening, Outcome::WindowElapsed) if self.capturing => {
                self.capturing = false;
                self.state = S::Thinking;
                vec![Effect::FinishCapture]
            }
            (S::Listening | S::Error, Outcome::ResumeListening) if !self.capturing => {
                self.listen()
            }

            (S::Thinking, Outcome::Captured(None)) => {
                self.retry(self.timings.retry_backoff, None)
            }
            (S::Thinking, Outcome::Captured(Some(blob))) => vec![Effect::Transcribe(blob)],
            (S::Thinking, Outcome::Transcribed(text)) => {
                match text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) {
                    Some(text) => {
                        self.pending_user_text = Some(text.clone());
                        vec![Effect::Caption(text.clone()), Effect::Answer(text)]
                    }
                    None => self.retry(self.timings.fallback_backoff, Some(NOT_HEARD)),
                }
            }
            (S::Thinking, Outcome::TranscriptionFailed | Outcome::AnswerFailed) => {
                self.pending_user_text = None;
                self.fail(CONNECTION_ERROR)
            }
            (S::Thinking, Outcome::Answered { answer, audio }) => {
                self.failures = 0;
                let user_text = self.pending_user_text.take().unwrap_or_default();
                let mut effects = vec![Effect::EmitTurn {
                    user_text,
                    assistant_text: answer,
                    audio: audio.clone(),
                }];
                match audio {
                    Some(url) => {
                        self.state = S::Speaking;
                        effects.push(Effect::Play(url));
                    }
                    None => {
                        self.state = S::Listening;
                        effects.push(self.resume_after(self.timings.retry_backoff));
                    }
                }
                effects
            }

            (S::Speaking, Outcome::PlaybackEnded) => {
                self.state = S::Listening;
                vec![self.resume_after(self.timings.post_speak_delay)]
            }

            (state, outcome) => {
                tracing::trace!(%state, ?outcome, "outcome not applicable");
                Vec::new()
            }
        }
    }

    /// Enter Listening and open the recorder
    fn listen(&mut self) -> Vec<Effect> {
        self.state = ConversationState::Listening;
        self.capturing = false;
        vec![Effect::StartCapture]
    }

    const fn resume_after(&self, delay: Duration) -> Effect {
        Effect::Schedule {
            delay,
            then: Outcome::ResumeListening,
        }
    }

    /// Transcription-class failure: back to Listening after `delay`
    fn retry(&mut self, delay: Duration, caption: Option<&str>) -> Vec<Effect> {
        if let Some(effects) = self.count_failure() {
            return effects;
        }
        self.state = ConversationState::Listening;
        let mut effects: Vec<Effect> = caption
            .map(|c| Effect::Caption(c.to_string()))
            .into_iter()
            .collect();
        effects.push(self.resume_after(delay));
        effects
    }

    /// Network-class failure: through Error after the error backoff
    fn fail(&mut self, caption: &str) -> Vec<Effect> {
        if let Some(effects) = self.count_failure() {
            return effects;
        }
        self.state = ConversationState::Error;
        self.capturing = false;
        vec![
            Effect::Caption(caption.to_string()),
            self.resume_after(self.timings.error_backoff),
        ]
    }

    /// Count a recoverable failure; halts once the cap is exceeded
    fn count_failure(&mut self) -> Option<Vec<Effect>> {
        self.failures = self.failures.saturating_add(1);
        match self.max_retries {
            Some(max) if self.failures > max => {
                let attempts = self.failures;
                tracing::warn!(attempts, "giving up after repeated failures");
                Some(self.halt(Notice::RetriesExhausted { attempts }))
            }
            _ => None,
        }
    }

    /// Pause with a notice
    fn halt(&mut self, notice: Notice) -> Vec<Effect> {
        self.invalidate();
        self.state = ConversationState::Paused;
        let mut effects = self.teardown();
        effects.push(Effect::Notify(notice));
        effects
    }

    /// Stop everything in flight and give the microphone back
    fn teardown(&mut self) -> Vec<Effect> {
        let mut effects = Vec::with_capacity(3);
        if self.capturing {
            self.capturing = false;
            effects.push(Effect::DiscardCapture);
        }
        effects.push(Effect::StopPlayback);
        effects.push(Effect::ReleaseMic);
        effects
    }

    fn invalidate(&mut self) {
        self.liveness = self.liveness.next();
        self.pending_user_text = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> Machine {
        Machine::new(&ConversationConfig::default())
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn cont(m: &Machine, outcome: Outcome) -> Event {
        Event::Continue(m.token(), outcome)
    }

    /// Drive a fresh machine to Listening with the recorder running
    fn listening() -> Machine {
        let mut m = machine();
        m.handle(Event::Open);
        m.handle(cont(
            &m,
            Outcome::GreetingFetched {
                text: None,
                audio: None,
            },
        ));
        m.handle(cont(&m, Outcome::CaptureStarted));
        assert_eq!(m.state(), ConversationState::Listening);
        assert!(m.is_capturing());
        m
    }

    /// Drive to Thinking with a transcript pending an answer
    fn thinking(text: &str) -> Machine {
        let mut m = listening();
        m.handle(cont(&m, Outcome::WindowElapsed));
        m.handle(cont(&m, Outcome::Captured(Some(b"RIFF".to_vec()))));
        m.handle(cont(&m, Outcome::Transcribed(Some(text.to_string()))));
        assert_eq!(m.state(), ConversationState::Thinking);
        m
    }

    #[test]
    fn test_open_acquires_mic_then_fetches_greeting() {
        let mut m = machine();
        let effects = m.handle(Event::Open);
        assert_eq!(m.state(), ConversationState::Greeting);
        assert_eq!(effects.first(), Some(&Effect::AcquireMic));
        assert_eq!(effects.last(), Some(&Effect::FetchGreeting));

        // Already open
        assert!(m.handle(Event::Open).is_empty());
    }

    #[test]
    fn test_greeting_with_audio_plays() {
        let mut m = machine();
        m.handle(Event::Open);
        let audio = url("data:audio/mp3;base64,SUQz");
        let effects = m.handle(cont(
            &m,
            Outcome::GreetingFetched {
                text: Some("Namaste".to_string()),
                audio: Some(audio.clone()),
            },
        ));
        assert_eq!(m.state(), ConversationState::Greeting);
        assert_eq!(
            effects,
            vec![Effect::Caption("Namaste".to_string()), Effect::Play(audio)]
        );

        let effects = m.handle(cont(&m, Outcome::PlaybackEnded));
        assert_eq!(m.state(), ConversationState::Listening);
        assert_eq!(effects, vec![Effect::StartCapture]);
    }

    #[test]
    fn test_greeting_without_audio_listens() {
        let mut m = machine();
        m.handle(Event::Open);
        let effects = m.handle(cont(
            &m,
            Outcome::GreetingFetched {
                text: None,
                audio: None,
            },
        ));
        assert_eq!(m.state(), ConversationState::Listening);
        assert_eq!(effects, vec![Effect::StartCapture]);
        assert!(!effects.iter().any(|e| matches!(e, Effect::Play(_))));
    }

    #[test]
    fn test_greeting_failure_recovers_through_error() {
        let mut m = machine();
        m.handle(Event::Open);
        let effects = m.handle(cont(&m, Outcome::GreetingFailed));
        assert_eq!(m.state(), ConversationState::Error);
        assert_eq!(
            effects,
            vec![
                Effect::Caption(CONNECTION_ERROR.to_string()),
                Effect::Schedule {
                    delay: Duration::from_millis(3000),
                    then: Outcome::ResumeListening,
                },
            ]
        );

        let effects = m.handle(cont(&m, Outcome::ResumeListening));
        assert_eq!(m.state(), ConversationState::Listening);
        assert_eq!(effects, vec![Effect::StartCapture]);
    }

    #[test]
    fn test_capture_started_arms_window() {
        let mut m = machine();
        m.handle(Event::Open);
        m.handle(cont(
            &m,
            Outcome::GreetingFetched {
                text: None,
                audio: None,
            },
        ));
        let effects = m.handle(cont(&m, Outcome::CaptureStarted));
        assert_eq!(
            effects,
            vec![
                Effect::Caption(String::new()),
                Effect::Schedule {
                    delay: Duration::from_millis(5000),
                    then: Outcome::WindowElapsed,
                },
            ]
        );
    }

    #[test]
    fn test_window_elapsed_finishes_capture() {
        let mut m = listening();
        let effects = m.handle(cont(&m, Outcome::WindowElapsed));
        assert_eq!(m.state(), ConversationState::Thinking);
        assert_eq!(effects, vec![Effect::FinishCapture]);
        assert!(!m.is_capturing());
    }

    #[test]
    fn test_missing_blob_retries() {
        let mut m = listening();
        m.handle(cont(&m, Outcome::WindowElapsed));
        let effects = m.handle(cont(&m, Outcome::Captured(None)));
        assert_eq!(m.state(), ConversationState::Listening);
        assert_eq!(
            effects,
            vec![Effect::Schedule {
                delay: Duration::from_millis(1000),
                then: Outcome::ResumeListening,
            }]
        );
    }

    #[test]
    fn test_empty_transcript_never_asks_for_answer() {
        let mut m = listening();
        m.handle(cont(&m, Outcome::WindowElapsed));
        m.handle(cont(&m, Outcome::Captured(Some(b"RIFF".to_vec()))));

        for heard in [None, Some(String::new()), Some("   ".to_string())] {
            let effects = m.handle(cont(&m, Outcome::Transcribed(heard)));
            assert!(!effects.iter().any(|e| matches!(e, Effect::Answer(_))));
            assert!(effects.contains(&Effect::Caption(NOT_HEARD.to_string())));
            assert!(effects.contains(&Effect::Schedule {
                delay: Duration::from_millis(1500),
                then: Outcome::ResumeListening,
            }));
            assert_eq!(m.state(), ConversationState::Listening);

            // Back to Thinking for the next case
            m.handle(cont(&m, Outcome::ResumeListening));
            m.handle(cont(&m, Outcome::CaptureStarted));
            m.handle(cont(&m, Outcome::WindowElapsed));
            m.handle(cont(&m, Outcome::Captured(Some(b"RIFF".to_vec()))));
        }
    }

    #[test]
    fn test_transcript_captioned_before_answer_request() {
        let mut m = listening();
        m.handle(cont(&m, Outcome::WindowElapsed));
        m.handle(cont(&m, Outcome::Captured(Some(b"RIFF".to_vec()))));
        let effects = m.handle(cont(
            &m,
            Outcome::Transcribed(Some(" What is Vata? ".to_string())),
        ));
        assert_eq!(
            effects,
            vec![
                Effect::Caption("What is Vata?".to_string()),
                Effect::Answer("What is Vata?".to_string()),
            ]
        );
    }

    #[test]
    fn test_answer_with_audio_emits_turn_then_speaks() {
        let mut m = thinking("What is Vata?");
        let audio = url("https://veda.example/vata.mp3");
        let effects = m.handle(cont(
            &m,
            Outcome::Answered {
                answer: "Vata is one of the three doshas...".to_string(),
                audio: Some(audio.clone()),
            },
        ));
        assert_eq!(m.state(), ConversationState::Speaking);
        assert_eq!(
            effects,
            vec![
                Effect::EmitTurn {
                    user_text: "What is Vata?".to_string(),
                    assistant_text: "Vata is one of the three doshas...".to_string(),
                    audio: Some(audio.clone()),
                },
                Effect::Play(audio),
            ]
        );

        let effects = m.handle(cont(&m, Outcome::PlaybackEnded));
        assert_eq!(m.state(), ConversationState::Listening);
        assert_eq!(
            effects,
            vec![Effect::Schedule {
                delay: Duration::from_millis(500),
                then: Outcome::ResumeListening,
            }]
        );
    }

    #[test]
    fn test_answer_without_audio_resumes_listening() {
        let mut m = thinking("What is Pitta?");
        let effects = m.handle(cont(
            &m,
            Outcome::Answered {
                answer: "Pitta governs digestion.".to_string(),
                audio: None,
            },
        ));
        assert_eq!(m.state(), ConversationState::Listening);
        assert!(matches!(effects[0], Effect::EmitTurn { .. }));
        assert_eq!(
            effects[1],
            Effect::Schedule {
                delay: Duration::from_millis(1000),
                then: Outcome::ResumeListening,
            }
        );
    }

    #[test]
    fn test_answer_failure_goes_to_error() {
        let mut m = thinking("What is Kapha?");
        let effects = m.handle(cont(&m, Outcome::AnswerFailed));
        assert_eq!(m.state(), ConversationState::Error);
        assert_eq!(effects[0], Effect::Caption(CONNECTION_ERROR.to_string()));
    }

    #[test]
    fn test_pause_mid_thinking_drops_late_answer() {
        let mut m = thinking("What is Vata?");
        let stale = m.token();

        let effects = m.handle(Event::Pause);
        assert_eq!(m.state(), ConversationState::Paused);
        assert_eq!(effects, vec![Effect::StopPlayback, Effect::ReleaseMic]);

        let effects = m.handle(Event::Continue(
            stale,
            Outcome::Answered {
                answer: "late".to_string(),
                audio: None,
            },
        ));
        assert!(effects.is_empty());
        assert_eq!(m.state(), ConversationState::Paused);
    }

    #[test]
    fn test_pause_while_capturing_discards() {
        let mut m = listening();
        let effects = m.handle(Event::Pause);
        assert_eq!(
            effects,
            vec![
                Effect::DiscardCapture,
                Effect::StopPlayback,
                Effect::ReleaseMic,
            ]
        );
        assert!(!m.is_capturing());
    }

    #[test]
    fn test_resume_reacquires_and_listens() {
        let mut m = listening();
        m.handle(Event::Pause);
        let effects = m.handle(Event::Resume);
        assert_eq!(m.state(), ConversationState::Listening);
        assert_eq!(
            effects,
            vec![Effect::AcquireMic, Effect::ClearNotice, Effect::StartCapture]
        );

        // Only a paused conversation resumes
        assert!(m.handle(Event::Resume).is_empty());
    }

    #[test]
    fn test_close_from_any_state_returns_to_idle() {
        let mut m = thinking("What is Vata?");
        let stale = m.token();
        let effects = m.handle(Event::Close);
        assert_eq!(m.state(), ConversationState::Idle);
        assert!(effects.contains(&Effect::ReleaseMic));
        assert!(effects.contains(&Effect::StopPlayback));
        assert!(
            m.handle(Event::Continue(stale, Outcome::AnswerFailed))
                .is_empty()
        );

        // Closing an idle machine is a no-op
        assert!(m.handle(Event::Close).is_empty());
    }

    #[test]
    fn test_stale_timer_after_close_and_reopen() {
        let mut m = listening();
        let stale = m.token();
        m.handle(Event::Close);
        m.handle(Event::Open);

        assert!(
            m.handle(Event::Continue(stale, Outcome::WindowElapsed))
                .is_empty()
        );
        assert_eq!(m.state(), ConversationState::Greeting);
    }

    #[test]
    fn test_permanent_capture_failure_pauses_without_retry() {
        let mut m = machine();
        m.handle(Event::Open);
        m.handle(cont(
            &m,
            Outcome::GreetingFetched {
                text: None,
                audio: None,
            },
        ));
        let effects = m.handle(cont(
            &m,
            Outcome::CaptureFailed {
                permanent: true,
                reason: "access denied".to_string(),
            },
        ));
        assert_eq!(m.state(), ConversationState::Paused);
        assert!(effects.contains(&Effect::Notify(Notice::MicrophoneDenied(
            "access denied".to_string()
        ))));
        assert!(!effects.iter().any(|e| matches!(
            e,
            Effect::Schedule { .. } | Effect::StartCapture
        )));
    }

    #[test]
    fn test_transient_capture_failure_recovers() {
        let mut m = machine();
        m.handle(Event::Open);
        m.handle(cont(
            &m,
            Outcome::GreetingFetched {
                text: None,
                audio: None,
            },
        ));
        m.handle(cont(
            &m,
            Outcome::CaptureFailed {
                permanent: false,
                reason: "buffer underrun".to_string(),
            },
        ));
        assert_eq!(m.state(), ConversationState::Error);
    }

    #[test]
    fn test_mic_refusal_pauses_with_notice() {
        let mut m = machine();
        m.handle(Event::Open);
        let effects = m.handle(cont(&m, Outcome::MicUnavailable("held".to_string())));
        assert_eq!(m.state(), ConversationState::Paused);
        assert_eq!(
            effects.last(),
            Some(&Effect::Notify(Notice::MicrophoneBusy("held".to_string())))
        );
    }

    #[test]
    fn test_retry_cap_pauses() {
        let config = ConversationConfig {
            max_retries: Some(2),
            ..ConversationConfig::default()
        };
        let mut m = Machine::new(&config);
        m.handle(Event::Open);

        m.handle(cont(&m, Outcome::GreetingFailed));
        assert_eq!(m.state(), ConversationState::Error);
        m.handle(cont(&m, Outcome::ResumeListening));
        m.handle(cont(&m, Outcome::CaptureStarted));
        m.handle(cont(&m, Outcome::WindowElapsed));
        m.handle(cont(&m, Outcome::Captured(None)));
        assert_eq!(m.state(), ConversationState::Listening);

        m.handle(cont(&m, Outcome::ResumeListening));
        m.handle(cont(&m, Outcome::CaptureStarted));
        m.handle(cont(&m, Outcome::WindowElapsed));
        let effects = m.handle(cont(&m, Outcome::Captured(None)));
        assert_eq!(m.state(), ConversationState::Paused);
        assert_eq!(
            effects.last(),
            Some(&Effect::Notify(Notice::RetriesExhausted { attempts: 3 }))
        );
    }

    #[test]
    fn test_completed_turn_resets_failures() {
        let config = ConversationConfig {
            max_retries: Some(1),
            ..ConversationConfig::default()
        };
        let mut m = Machine::new(&config);
        m.handle(Event::Open);
        m.handle(cont(
            &m,
            Outcome::GreetingFetched {
                text: None,
                audio: None,
            },
        ));

        for _ in 0..3 {
            m.handle(cont(&m, Outcome::CaptureStarted));
            m.handle(cont(&m, Outcome::WindowElapsed));
            m.handle(cont(&m, Outcome::Captured(None)));
            assert_eq!(m.state(), ConversationState::Listening);
            m.handle(cont(&m, Outcome::ResumeListening));
            m.handle(cont(&m, Outcome::CaptureStarted));
            m.handle(cont(&m, Outcome::WindowElapsed));
            m.handle(cont(&m, Outcome::Captured(Some(b"RIFF".to_vec()))));
            m.handle(cont(&m, Outcome::Transcribed(Some("hello".to_string()))));
            m.handle(cont(
                &m,
                Outcome::Answered {
                    answer: "hi".to_string(),
                    audio: None,
                },
            ));
            m.handle(cont(&m, Outcome::ResumeListening));
        }
        assert_eq!(m.state(), ConversationState::Listening);
    }

    #[test]
    fn test_unlimited_retries() {
        let config = ConversationConfig {
            max_retries: None,
            ..ConversationConfig::default()
        };
        let mut m = Machine::new(&config);
        m.handle(Event::Open);
        for _ in 0..50 {
            m.handle(cont(&m, Outcome::GreetingFailed));
            m.handle(cont(&m, Outcome::ResumeListening));
            m.handle(cont(&m, Outcome::CaptureStarted));
            m.handle(cont(&m, Outcome::WindowElapsed));
            m.handle(cont(&m, Outcome::Captured(None)));
            m.handle(cont(&m, Outcome::ResumeListening));
        }
        assert_eq!(m.state(), ConversationState::Listening);
    }

    #[test]
    fn test_unrelated_outcome_ignored() {
        let mut m = listening();
        assert!(m.handle(cont(&m, Outcome::PlaybackEnded)).is_empty());
        assert!(m.handle(cont(&m, Outcome::ResumeListening)).is_empty());
        assert_eq!(m.state(), ConversationState::Listening);
    }
}
