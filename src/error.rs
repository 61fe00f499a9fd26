//! Error types for Karuna

use thiserror::Error;

use crate::voice::MicOwner;

/// Result type alias for Karuna operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Karuna
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Transient audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Microphone access permanently refused (no device, denied, unavailable)
    #[error("microphone unavailable: {0}")]
    MicPermission(String),

    /// Microphone is held by another consumer
    #[error("microphone busy: {requested} requested while held by {holder}")]
    MicBusy {
        /// Consumer that asked for the microphone
        requested: MicOwner,
        /// Consumer currently holding it
        holder: MicOwner,
    },

    /// Wake word engine failed to initialize or run
    #[error("wake word error: {0}")]
    WakeWord(String),

    /// Speech-to-text provider error
    #[error("STT error: {0}")]
    Stt(String),

    /// Backend returned an unsuccessful response
    #[error("backend error: {0}")]
    Backend(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether retrying the failed capture can never succeed
    #[must_use]
    pub const fn is_permanent_capture_failure(&self) -> bool {
        matches!(self, Self::MicPermission(_))
    }
}
