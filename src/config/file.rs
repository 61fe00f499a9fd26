//! TOML configuration file loading
//!
//! Supports `~/.config/karuna/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::SttProvider;
use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct KarunaConfigFile {
    /// Backend connection
    #[serde(default)]
    pub backend: BackendFileConfig,

    /// Conversation loop timings and limits
    #[serde(default)]
    pub conversation: ConversationFileConfig,

    /// Wake word engine
    #[serde(default)]
    pub wake_word: WakeWordFileConfig,
}

/// Backend connection configuration
#[derive(Debug, Default, Deserialize)]
pub struct BackendFileConfig {
    /// Base URL (e.g. "http://127.0.0.1:8000")
    pub url: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: Option<u64>,
}

/// Conversation loop configuration
#[derive(Debug, Default, Deserialize)]
pub struct ConversationFileConfig {
    pub capture_window_ms: Option<u64>,
    pub retry_backoff_ms: Option<u64>,
    pub fallback_backoff_ms: Option<u64>,
    pub error_backoff_ms: Option<u64>,
    pub post_speak_delay_ms: Option<u64>,

    /// Consecutive recoverable failures before pausing (0 = unlimited)
    pub max_retries: Option<u32>,
}

/// Wake word configuration
#[derive(Debug, Default, Deserialize)]
pub struct WakeWordFileConfig {
    /// Enable passive wake word listening
    pub enabled: Option<bool>,

    /// Display label (e.g. "Hey Karuna")
    pub label: Option<String>,

    /// Phrases that count as the wake word; defaults to the label
    pub phrases: Option<Vec<String>>,

    /// Verification provider ("whisper" or "deepgram")
    pub provider: Option<SttProvider>,

    /// Verification model (e.g. "whisper-1", "nova-2")
    pub model: Option<String>,

    /// Verification provider API key
    pub access_key: Option<String>,

    /// RMS energy above which audio counts as speech
    pub energy_threshold: Option<f32>,

    /// Minimum speech duration for a candidate phrase
    pub min_speech_ms: Option<u32>,

    /// Trailing silence that ends a candidate phrase
    pub silence_ms: Option<u32>,

    /// Longest candidate phrase before it is cut off
    pub max_speech_ms: Option<u32>,
}

/// Load the TOML config file from the standard path
///
/// Returns `KarunaConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> KarunaConfigFile {
    let Some(path) = config_file_path() else {
        return KarunaConfigFile::default();
    };

    if !path.exists() {
        return KarunaConfigFile::default();
    }

    match load_config_file_from(&path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            KarunaConfigFile::default()
        }
    }
}

/// Load a config file from an explicit path
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed
pub fn load_config_file_from(path: &Path) -> Result<KarunaConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Return the config file path: `~/.config/karuna/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("karuna").join("config.toml"))
}
