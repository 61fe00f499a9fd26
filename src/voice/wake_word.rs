//! Wake word detection
//!
//! Passive listening while the conversation is idle or paused. The production
//! engine is a hybrid: local energy segmentation picks candidate utterances
//! and a cloud STT provider confirms the phrase.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::capture::{AudioCapture, SAMPLE_RATE, samples_to_wav};
use super::mic::{MicArbiter, MicOwner};
use super::segment::{ModelSpec, SpeechSegmenter};
use super::verify::{SpeechToText, Transcriber};
use crate::config::{SttProvider, WakeWordConfig};
use crate::{Error, Result};

/// Samples fed to the segmenter per step (100 ms)
const CHUNK_SAMPLES: usize = 1600;

/// What to listen for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordSpec {
    /// Name reported with each detection
    pub label: String,
    /// Accepted phrasings, e.g. "hey karuna"
    pub phrases: Vec<String>,
}

/// One recognized wake phrase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    /// Label of the keyword that matched
    pub label: String,
    /// What the verifier heard
    pub transcript: String,
    /// When the match was confirmed
    pub at: DateTime<Utc>,
}

/// Keyword spotting backend driven by [`WakeWordDetector`]
pub trait KeywordEngine {
    /// Begin listening; detections go to `detections` until [`stop`]
    ///
    /// [`stop`]: KeywordEngine::stop
    ///
    /// # Errors
    ///
    /// Returns error if the input device cannot be opened
    fn start(&mut self, detections: mpsc::UnboundedSender<Detection>) -> Result<()>;

    /// Stop listening and close the input device
    fn stop(&mut self);

    /// Process audio gathered since the last call
    fn pump(&mut self) {}
}

/// Lowercase, strip punctuation, collapse whitespace
fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Find the first phrase contained in `transcript`, ignoring case and punctuation
#[must_use]
pub fn match_phrase<'a>(transcript: &str, phrases: &'a [String]) -> Option<&'a str> {
    let heard = normalize(transcript);
    phrases
        .iter()
        .find(|phrase| {
            let phrase = normalize(phrase);
            !phrase.is_empty() && heard.contains(&phrase)
        })
        .map(String::as_str)
}

/// Energy segmentation plus cloud verification
pub struct PhraseSpotter {
    keyword: KeywordSpec,
    segmenter: SpeechSegmenter,
    verifier: Arc<dyn Transcriber>,
    capture: Option<AudioCapture>,
    detections: Option<mpsc::UnboundedSender<Detection>>,
}

impl PhraseSpotter {
    /// Initialize the engine with a provider access key
    ///
    /// # Errors
    ///
    /// Returns `Error::WakeWord` for a missing key, no usable phrases or
    /// invalid thresholds
    pub fn init(
        access_key: Option<&str>,
        keyword: KeywordSpec,
        model: ModelSpec,
        provider: SttProvider,
        stt_model: &str,
    ) -> Result<Self> {
        let verifier = SpeechToText::new(provider, access_key, stt_model)?;
        Self::with_verifier(keyword, model, Arc::new(verifier))
    }

    /// Initialize from the resolved `[wake_word]` config
    ///
    /// # Errors
    ///
    /// Same as [`PhraseSpotter::init`]
    pub fn from_config(config: &WakeWordConfig) -> Result<Self> {
        Self::init(
            config.access_key.as_deref(),
            KeywordSpec {
                label: config.label.clone(),
                phrases: config.phrases.clone(),
            },
            ModelSpec {
                energy_threshold: config.energy_threshold,
                min_speech_ms: config.min_speech_ms,
                silence_ms: config.silence_ms,
                max_speech_ms: config.max_speech_ms,
            },
            config.provider,
            &config.model,
        )
    }

    /// Initialize with a custom verifier
    ///
    /// # Errors
    ///
    /// Returns `Error::WakeWord` for no usable phrases or invalid thresholds
    pub fn with_verifier(
        keyword: KeywordSpec,
        model: ModelSpec,
        verifier: Arc<dyn Transcriber>,
    ) -> Result<Self> {
        model.validate()?;

        let phrases: Vec<String> = keyword
            .phrases
            .iter()
            .map(|p| normalize(p))
            .filter(|p| !p.is_empty())
            .collect();
        if phrases.is_empty() {
            return Err(Error::WakeWord("no wake phrases configured".to_string()));
        }

        tracing::debug!(label = %keyword.label, ?phrases, "wake word engine initialized");

        Ok(Self {
            keyword: KeywordSpec {
                label: keyword.label,
                phrases,
            },
            segmenter: SpeechSegmenter::new(model),
            verifier,
            capture: None,
            detections: None,
        })
    }

    /// Phrases after normalization
    #[must_use]
    pub fn phrases(&self) -> &[String] {
        &self.keyword.phrases
    }

    /// Feed raw samples through segmentation and verification
    ///
    /// Confirmed matches are delivered asynchronously on the detection
    /// channel; requires a tokio runtime.
    pub fn feed(&mut self, samples: &[f32]) {
        let Some(detections) = self.detections.clone() else {
            return;
        };

        for chunk in samples.chunks(CHUNK_SAMPLES) {
            let Some(segment) = self.segmenter.process(chunk) else {
                continue;
            };

            let wav = match samples_to_wav(&segment, SAMPLE_RATE) {
                Ok(wav) => wav,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode wake segment");
                    continue;
                }
            };

            let verifier = Arc::clone(&self.verifier);
            let keyword = self.keyword.clone();
            let detections = detections.clone();
            tokio::spawn(async move {
                let transcript = match verifier.transcribe(&wav).await {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::debug!(error = %e, "wake verification failed");
                        return;
                    }
                };

                if match_phrase(&transcript, &keyword.phrases).is_some() {
                    tracing::info!(label = %keyword.label, %transcript, "wake word detected");
                    // Receiver is gone once listening stopped
                    let _ = detections.send(Detection {
                        label: keyword.label,
                        transcript,
                        at: Utc::now(),
                    });
                } else {
                    tracing::trace!(%transcript, "not a wake phrase");
                }
            });
        }
    }
}

impl KeywordEngine for PhraseSpotter {
    fn start(&mut self, detections: mpsc::UnboundedSender<Detection>) -> Result<()> {
        let mut capture = AudioCapture::new()?;
        capture.start()?;
        self.capture = Some(capture);
        self.segmenter.reset();
        self.detections = Some(detections);
        tracing::debug!("wake word listening started");
        Ok(())
    }

    fn stop(&mut self) {
        self.detections = None;
        self.segmenter.reset();
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
            tracing::debug!("wake word listening stopped");
        }
    }

    fn pump(&mut self) {
        let samples = match self.capture.as_ref() {
            Some(capture) => capture.drain(),
            None => return,
        };
        if !samples.is_empty() {
            self.feed(&samples);
        }
    }
}

/// Passive listener that only runs while it owns the microphone
pub struct WakeWordDetector {
    engine: Box<dyn KeywordEngine>,
    detections: Option<mpsc::UnboundedReceiver<Detection>>,
}

impl WakeWordDetector {
    /// Wrap an initialized engine
    #[must_use]
    pub fn new(engine: Box<dyn KeywordEngine>) -> Self {
        Self {
            engine,
            detections: None,
        }
    }

    /// Start passive listening
    ///
    /// # Errors
    ///
    /// Returns `Error::MicBusy` unless the arbiter has assigned the
    /// microphone to the wake word, or the engine's error if it cannot start
    pub fn start(&mut self, arbiter: &MicArbiter) -> Result<()> {
        let holder = arbiter.current_owner();
        if holder != MicOwner::WakeWord {
            return Err(Error::MicBusy {
                requested: MicOwner::WakeWord,
                holder,
            });
        }
        if self.is_listening() {
            return Ok(());
        }

        // Fresh channel per listening period
        let (tx, rx) = mpsc::unbounded_channel();
        self.engine.start(tx)?;
        self.detections = Some(rx);
        Ok(())
    }

    /// Stop listening; pending detections are discarded
    pub fn stop(&mut self) {
        if self.detections.take().is_some() {
            self.engine.stop();
        }
    }

    /// Whether passive listening is active
    #[must_use]
    pub const fn is_listening(&self) -> bool {
        self.detections.is_some()
    }

    /// Let the engine process buffered audio
    pub fn pump(&mut self) {
        if self.is_listening() {
            self.engine.pump();
        }
    }

    /// Wait for the next detection; never resolves while not listening
    pub async fn next_detection(&mut self) -> Option<Detection> {
        match self.detections.as_mut() {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }
}
