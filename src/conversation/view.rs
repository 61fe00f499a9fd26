//! What the overlay renders

use std::fmt;

use super::machine::ConversationState;

/// Persistent, user-actionable message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The microphone cannot be used at all
    MicrophoneDenied(String),
    /// Another consumer held the microphone
    MicrophoneBusy(String),
    /// Passive wake word listening is disabled
    WakeWordUnavailable(String),
    /// Recoverable failures kept repeating
    RetriesExhausted {
        /// Consecutive failures before giving up
        attempts: u32,
    },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MicrophoneDenied(reason) => {
                write!(f, "Microphone access denied ({reason}). Check permissions, then resume.")
            }
            Self::MicrophoneBusy(reason) => {
                write!(f, "Microphone is in use ({reason}). Resume to try again.")
            }
            Self::WakeWordUnavailable(reason) => write!(
                f,
                "Wake word unavailable ({reason}). Press Enter to talk instead."
            ),
            Self::RetriesExhausted { attempts } => write!(
                f,
                "Stopped after {attempts} failed attempts in a row. Resume to try again."
            ),
        }
    }
}

/// Snapshot published to the overlay after every transition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlayView {
    /// Current conversation state
    pub state: ConversationState,
    /// Transient line: transcript, fallback text or error text
    pub caption: String,
    /// Persistent notice, if any
    pub notice: Option<Notice>,
}
