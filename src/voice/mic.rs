//! Microphone ownership
//!
//! One physical input device, two consumers. The arbiter only records who
//! holds the device; callers sequence the handoff (stop the holder, release,
//! acquire, start the new owner) so two captures never run at once.

use std::fmt;

use crate::{Error, Result};

/// Who currently holds the microphone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MicOwner {
    /// Nobody
    #[default]
    None,
    /// Passive wake word listening
    WakeWord,
    /// The active voice conversation
    VoiceMode,
}

impl fmt::Display for MicOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::WakeWord => write!(f, "wake word"),
            Self::VoiceMode => write!(f, "voice mode"),
        }
    }
}

/// Exclusive-ownership broker for the microphone
#[derive(Debug, Default)]
pub struct MicArbiter {
    owner: MicOwner,
}

impl MicArbiter {
    /// Create an arbiter with nobody holding the microphone
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the microphone for `owner`
    ///
    /// Acquiring again as the current owner succeeds without change.
    ///
    /// # Errors
    ///
    /// Returns `Error::MicBusy` while another consumer holds the microphone
    pub fn acquire(&mut self, owner: MicOwner) -> Result<()> {
        if owner == MicOwner::None {
            return Ok(());
        }

        match self.owner {
            MicOwner::None => {
                self.owner = owner;
                tracing::debug!(%owner, "microphone acquired");
                Ok(())
            }
            holder if holder == owner => Ok(()),
            holder => Err(Error::MicBusy {
                requested: owner,
                holder,
            }),
        }
    }

    /// Give the microphone back; ignored unless `owner` holds it
    pub fn release(&mut self, owner: MicOwner) {
        if owner != MicOwner::None && self.owner == owner {
            self.owner = MicOwner::None;
            tracing::debug!(%owner, "microphone released");
        }
    }

    /// Current holder
    #[must_use]
    pub const fn current_owner(&self) -> MicOwner {
        self.owner
    }
}
