//! Configuration management for Karuna

pub mod file;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

/// Default backend base URL
pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000";

/// Default wake phrase
pub const DEFAULT_WAKE_LABEL: &str = "Hey Karuna";

/// Karuna configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend connection
    pub backend: BackendConfig,

    /// Conversation loop configuration
    pub conversation: ConversationConfig,

    /// Wake word configuration
    pub wake_word: WakeWordConfig,
}

/// Backend connection configuration
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Base URL of the assistant backend
    pub url: String,

    /// Per-request timeout
    pub timeout: Duration,
}

/// Conversation loop configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationConfig {
    /// Delays between conversation steps
    pub timings: Timings,

    /// Consecutive recoverable failures before the loop pauses itself;
    /// `None` retries forever
    pub max_retries: Option<u32>,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            timings: Timings::default(),
            max_retries: Some(5),
        }
    }
}

/// Named delays of the conversation loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Fixed listening window per turn
    pub capture_window: Duration,

    /// Backoff after an empty capture or an answer without audio
    pub retry_backoff: Duration,

    /// Backoff after an unintelligible transcription
    pub fallback_backoff: Duration,

    /// Backoff after a network or device failure
    pub error_backoff: Duration,

    /// Pause after the answer finished playing
    pub post_speak_delay: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            capture_window: Duration::from_millis(5000),
            retry_backoff: Duration::from_millis(1000),
            fallback_backoff: Duration::from_millis(1500),
            error_backoff: Duration::from_millis(3000),
            post_speak_delay: Duration::from_millis(500),
        }
    }
}

/// Speech-to-text provider used to verify wake phrases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SttProvider {
    /// `OpenAI` Whisper
    #[default]
    Whisper,
    /// Deepgram
    Deepgram,
}

impl SttProvider {
    /// Default transcription model for the provider
    #[must_use]
    pub const fn default_model(self) -> &'static str {
        match self {
            Self::Whisper => "whisper-1",
            Self::Deepgram => "nova-2",
        }
    }

    /// Environment variable holding the provider's API key
    #[must_use]
    pub const fn key_env(self) -> &'static str {
        match self {
            Self::Whisper => "OPENAI_API_KEY",
            Self::Deepgram => "DEEPGRAM_API_KEY",
        }
    }
}

impl FromStr for SttProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "whisper" | "openai" => Ok(Self::Whisper),
            "deepgram" => Ok(Self::Deepgram),
            other => Err(Error::Config(format!("unknown STT provider: {other}"))),
        }
    }
}

/// Wake word configuration
#[derive(Debug, Clone)]
pub struct WakeWordConfig {
    /// Enable passive wake word listening
    pub enabled: bool,

    /// Display label
    pub label: String,

    /// Phrases that count as the wake word
    pub phrases: Vec<String>,

    /// Verification provider
    pub provider: SttProvider,

    /// Verification model
    pub model: String,

    /// Verification provider API key
    pub access_key: Option<String>,

    /// RMS energy above which audio counts as speech
    pub energy_threshold: f32,

    /// Minimum speech duration for a candidate phrase
    pub min_speech_ms: u32,

    /// Trailing silence that ends a candidate phrase
    pub silence_ms: u32,

    /// Longest speech run buffered as one candidate phrase
    pub max_speech_ms: u32,
}

impl Config {
    /// Load configuration from the environment and the standard config file
    ///
    /// # Errors
    ///
    /// Returns error if an explicit config file cannot be read or a value is invalid
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let fc = match config_path {
            Some(path) => file::load_config_file_from(path)?,
            None => file::load_config_file(),
        };
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Merge a config file with environment lookups (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if a value is invalid
    #[allow(clippy::needless_pass_by_value)]
    pub fn resolve(
        fc: file::KarunaConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let parsed = |key: &str| env(key).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |key: &str, file: Option<u64>, default: Duration| {
            parsed(key)
                .or(file)
                .map_or(default, Duration::from_millis)
        };

        // Backend (env > toml > default)
        let backend = BackendConfig {
            url: env("KARUNA_BACKEND_URL")
                .or(fc.backend.url)
                .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            timeout: Duration::from_secs(
                parsed("KARUNA_BACKEND_TIMEOUT_SECS")
                    .or(fc.backend.timeout_secs)
                    .unwrap_or(120),
            ),
        };

        // Conversation timings (env > toml > default)
        let defaults = Timings::default();
        let conv = &fc.conversation;
        let timings = Timings {
            capture_window: millis(
                "KARUNA_CAPTURE_WINDOW_MS",
                conv.capture_window_ms,
                defaults.capture_window,
            ),
            retry_backoff: millis(
                "KARUNA_RETRY_BACKOFF_MS",
                conv.retry_backoff_ms,
                defaults.retry_backoff,
            ),
            fallback_backoff: millis(
                "KARUNA_FALLBACK_BACKOFF_MS",
                conv.fallback_backoff_ms,
                defaults.fallback_backoff,
            ),
            error_backoff: millis(
                "KARUNA_ERROR_BACKOFF_MS",
                conv.error_backoff_ms,
                defaults.error_backoff,
            ),
            post_speak_delay: millis(
                "KARUNA_POST_SPEAK_DELAY_MS",
                conv.post_speak_delay_ms,
                defaults.post_speak_delay,
            ),
        };

        if timings.capture_window.is_zero() {
            return Err(Error::Config(
                "capture window must be greater than zero".to_string(),
            ));
        }

        let max_retries = env("KARUNA_MAX_RETRIES")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .or(conv.max_retries)
            .map_or(ConversationConfig::default().max_retries, |n| {
                (n > 0).then_some(n)
            });

        // Wake word (env > toml > default)
        let ww = fc.wake_word;
        let provider = match env("KARUNA_WAKE_PROVIDER") {
            Some(value) => value.parse()?,
            None => ww.provider.unwrap_or_default(),
        };
        let label = ww
            .label
            .unwrap_or_else(|| DEFAULT_WAKE_LABEL.to_string());
        let phrases = env("KARUNA_WAKE_PHRASE")
            .map(|p| vec![p])
            .or(ww.phrases)
            .unwrap_or_else(|| vec![label.clone()]);
        let wake_word = WakeWordConfig {
            enabled: env("KARUNA_WAKE_WORD")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .or(ww.enabled)
                .unwrap_or(true),
            label,
            phrases,
            provider,
            model: env("KARUNA_WAKE_MODEL")
                .or(ww.model)
                .unwrap_or_else(|| provider.default_model().to_string()),
            access_key: env("KARUNA_WAKE_ACCESS_KEY")
                .or(ww.access_key)
                .or_else(|| env(provider.key_env())),
            energy_threshold: ww.energy_threshold.unwrap_or(0.03),
            min_speech_ms: ww.min_speech_ms.unwrap_or(300),
            silence_ms: ww.silence_ms.unwrap_or(500),
            max_speech_ms: ww.max_speech_ms.unwrap_or(10_000),
        };

        Ok(Self {
            backend,
            conversation: ConversationConfig {
                timings,
                max_retries,
            },
            wake_word,
        })
    }
}
