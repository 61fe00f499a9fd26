//! Turn recorder used by the conversation loop

use super::capture::{AudioCapture, SAMPLE_RATE, samples_to_wav};
use crate::Result;

/// Records one utterance per listening window
pub trait Recorder {
    /// Open the microphone and start recording
    ///
    /// # Errors
    ///
    /// Returns `Error::MicPermission` when access can never succeed,
    /// any other error for transient failures
    fn start(&mut self) -> Result<()>;

    /// Stop recording and hand over the WAV blob, if anything was captured
    fn stop(&mut self) -> Option<Vec<u8>>;

    /// Whether the microphone is currently open
    fn is_capturing(&self) -> bool;
}

/// [`Recorder`] over the default input device
///
/// The device is reopened for every turn and closed on stop, so the
/// microphone is free whenever the recorder is not capturing.
#[derive(Default)]
pub struct MicRecorder {
    capture: Option<AudioCapture>,
}

impl MicRecorder {
    /// Create a recorder; the device is opened on [`Recorder::start`]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Recorder for MicRecorder {
    fn start(&mut self) -> Result<()> {
        if self.capture.is_some() {
            return Ok(());
        }

        let mut capture = AudioCapture::new()?;
        capture.start()?;
        self.capture = Some(capture);
        tracing::debug!("recording started");
        Ok(())
    }

    fn stop(&mut self) -> Option<Vec<u8>> {
        let mut capture = self.capture.take()?;
        capture.stop();
        if capture.has_faulted() {
            tracing::warn!("input stream reported errors during the recording");
        }

        let samples = capture.drain();
        if samples.is_empty() {
            tracing::debug!("recording stopped with no audio");
            return None;
        }

        match samples_to_wav(&samples, SAMPLE_RATE) {
            Ok(wav) => {
                tracing::debug!(samples = samples.len(), bytes = wav.len(), "recording stopped");
                Some(wav)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode recording");
                None
            }
        }
    }

    fn is_capturing(&self) -> bool {
        self.capture.as_ref().is_some_and(AudioCapture::is_capturing)
    }
}
