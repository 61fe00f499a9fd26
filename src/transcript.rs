//! Conversation transcript shared between the voice overlay and the text view

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use url::Url;

/// Capacity of the live turn feed; slow subscribers lag rather than block
const FEED_CAPACITY: usize = 64;

/// One completed user/assistant exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    /// What the user said (or typed)
    pub user_text: String,
    /// The assistant's full answer
    pub assistant_text: String,
    /// Spoken answer audio, when the backend produced one
    pub audio_ref: Option<Url>,
    /// When the turn completed
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    /// Create a turn stamped with the current time
    #[must_use]
    pub fn new(
        user_text: impl Into<String>,
        assistant_text: impl Into<String>,
        audio_ref: Option<Url>,
    ) -> Self {
        Self {
            user_text: user_text.into(),
            assistant_text: assistant_text.into(),
            audio_ref,
            timestamp: Utc::now(),
        }
    }
}

/// Append-only sink for completed turns
///
/// Clones share one history, so every view reads the same turns.
#[derive(Debug, Clone)]
pub struct TranscriptBridge {
    turns: Arc<Mutex<Vec<Turn>>>,
    feed: broadcast::Sender<Turn>,
}

impl Default for TranscriptBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptBridge {
    /// Create an empty transcript
    #[must_use]
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            turns: Arc::new(Mutex::new(Vec::new())),
            feed,
        }
    }

    /// Append a completed turn
    pub fn append(&self, turn: Turn) {
        tracing::debug!(
            user_text = %turn.user_text,
            answer_len = turn.assistant_text.len(),
            has_audio = turn.audio_ref.is_some(),
            "turn appended"
        );
        if let Ok(mut turns) = self.turns.lock() {
            turns.push(turn.clone());
        }
        // No subscribers is fine
        let _ = self.feed.send(turn);
    }

    /// Snapshot of every turn so far
    #[must_use]
    pub fn history(&self) -> Vec<Turn> {
        self.turns
            .lock()
            .map(|turns| turns.clone())
            .unwrap_or_default()
    }

    /// Number of turns so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.lock().map(|turns| turns.len()).unwrap_or_default()
    }

    /// Whether no turn has completed yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receive turns as they are appended
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Turn> {
        self.feed.subscribe()
    }
}
