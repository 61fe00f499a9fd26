//! Process-scoped session identity
//!
//! The backend keys its conversational memory on the session id, so one id is
//! minted per process and sent unchanged with every request. It is never
//! persisted: a restart starts a fresh context.

use std::fmt;
use std::sync::OnceLock;

use serde::Serialize;
use uuid::Uuid;

static CURRENT: OnceLock<SessionId> = OnceLock::new();

/// Opaque session identifier attached to every backend call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an existing identifier
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The session of this process, created on first call
    pub fn current() -> &'static Self {
        CURRENT.get_or_init(|| {
            let id = Self::generate();
            tracing::info!(session = %id, "session created");
            id
        })
    }

    fn generate() -> Self {
        Self(format!("session_{}", Uuid::new_v4().simple()))
    }

    /// Borrow the identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
