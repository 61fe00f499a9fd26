//! Energy-based speech segmentation for wake phrase candidates

use super::capture::SAMPLE_RATE;
use crate::{Error, Result};

/// Detection thresholds for the phrase spotter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelSpec {
    /// RMS level above which a chunk counts as speech
    pub energy_threshold: f32,
    /// Shortest segment worth verifying
    pub min_speech_ms: u32,
    /// Trailing silence that ends a segment
    pub silence_ms: u32,
    /// Longest speech run kept as one segment
    pub max_speech_ms: u32,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            energy_threshold: 0.03,
            min_speech_ms: 300,
            silence_ms: 500,
            max_speech_ms: 10_000,
        }
    }
}

impl ModelSpec {
    /// Reject thresholds the segmenter cannot work with
    ///
    /// # Errors
    ///
    /// Returns `Error::WakeWord` for a non-positive energy threshold, zero
    /// durations or a maximum segment no longer than the minimum
    pub fn validate(&self) -> Result<()> {
        if !self.energy_threshold.is_finite() || self.energy_threshold <= 0.0 {
            return Err(Error::WakeWord(format!(
                "energy threshold must be positive, got {}",
                self.energy_threshold
            )));
        }
        if self.min_speech_ms == 0 || self.silence_ms == 0 {
            return Err(Error::WakeWord(
                "speech and silence durations must be non-zero".to_string(),
            ));
        }
        if self.max_speech_ms <= self.min_speech_ms {
            return Err(Error::WakeWord(format!(
                "max speech {} ms must exceed min speech {} ms",
                self.max_speech_ms, self.min_speech_ms
            )));
        }
        Ok(())
    }
}

/// Whether the segmenter is inside a speech run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Quiet,
    Speech,
}

/// Splits a microphone stream into utterances: speech followed by silence
pub struct SpeechSegmenter {
    energy_threshold: f32,
    min_speech: usize,
    silence: usize,
    max_speech: usize,
    phase: Phase,
    buffer: Vec<f32>,
    voiced: usize,
    silence_run: usize,
}

impl SpeechSegmenter {
    /// Create a segmenter for 16 kHz mono input
    #[must_use]
    pub fn new(spec: ModelSpec) -> Self {
        Self {
            energy_threshold: spec.energy_threshold,
            min_speech: ms_to_samples(spec.min_speech_ms),
            silence: ms_to_samples(spec.silence_ms),
            max_speech: ms_to_samples(spec.max_speech_ms),
            phase: Phase::Quiet,
            buffer: Vec::new(),
            voiced: 0,
            silence_run: 0,
        }
    }

    /// Feed a chunk; returns a finished segment when speech has been
    /// followed by enough silence or has run for the maximum length
    pub fn process(&mut self, samples: &[f32]) -> Option<Vec<f32>> {
        if samples.is_empty() {
            return None;
        }

        let energy = rms(samples);
        let is_speech = energy > self.energy_threshold;

        match self.phase {
            Phase::Quiet => {
                if is_speech {
                    self.phase = Phase::Speech;
                    self.buffer.clear();
                    self.buffer.extend_from_slice(samples);
                    self.voiced = samples.len();
                    self.silence_run = 0;
                    tracing::trace!(energy, "speech onset");
                }
                None
            }
            Phase::Speech => {
                self.buffer.extend_from_slice(samples);
                if is_speech {
                    self.voiced += samples.len();
                    self.silence_run = 0;
                } else {
                    self.silence_run += samples.len();
                }

                if self.silence_run > self.silence && self.voiced > self.min_speech {
                    tracing::debug!(samples = self.buffer.len(), "speech segment complete");
                    let segment = std::mem::take(&mut self.buffer);
                    self.reset();
                    return Some(segment);
                }

                // Steady noise never goes quiet; cut the run at the cap
                if self.buffer.len() >= self.max_speech {
                    tracing::debug!(samples = self.buffer.len(), "speech segment cut at maximum");
                    let mut segment = std::mem::take(&mut self.buffer);
                    segment.truncate(self.max_speech);
                    self.reset();
                    return Some(segment);
                }

                // Too much silence for too little speech
                if self.silence_run > self.silence * 2 {
                    tracing::trace!("segment too short, resetting");
                    self.reset();
                }
                None
            }
        }
    }

    /// Whether a speech run is in progress
    #[must_use]
    pub fn in_speech(&self) -> bool {
        self.phase == Phase::Speech
    }

    /// Drop any partial segment
    pub fn reset(&mut self) {
        self.phase = Phase::Quiet;
        self.buffer.clear();
        self.voiced = 0;
        self.silence_run = 0;
    }
}

fn ms_to_samples(ms: u32) -> usize {
    usize::try_from(u64::from(ms) * u64::from(SAMPLE_RATE) / 1000).unwrap_or(usize::MAX)
}

/// RMS energy of a chunk
#[allow(clippy::cast_precision_loss)]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms() {
        assert!(rms(&[0.0f32; 100]) < 0.001);
        assert!(rms(&[0.5f32; 100]) > 0.4);
        assert!(rms(&[]) < f32::EPSILON);
    }

    #[test]
    fn test_spec_validation() {
        assert!(ModelSpec::default().validate().is_ok());

        let negative = ModelSpec {
            energy_threshold: -1.0,
            ..ModelSpec::default()
        };
        assert!(matches!(negative.validate(), Err(Error::WakeWord(_))));

        let zero = ModelSpec {
            silence_ms: 0,
            ..ModelSpec::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_silence_never_starts_a_segment() {
        let mut segmenter = SpeechSegmenter::new(ModelSpec::default());
        for _ in 0..20 {
            assert!(segmenter.process(&[0.0; 1600]).is_none());
        }
        assert!(!segmenter.in_speech());
    }

    #[test]
    fn test_blip_is_dropped() {
        let mut segmenter = SpeechSegmenter::new(ModelSpec::default());
        // 100 ms of speech is below the 300 ms minimum
        assert!(segmenter.process(&[0.5; 1600]).is_none());
        for _ in 0..12 {
            assert!(segmenter.process(&[0.0; 1600]).is_none());
        }
        assert!(!segmenter.in_speech());
    }

    #[test]
    fn test_continuous_noise_is_bounded() {
        let spec = ModelSpec::default();
        let cap = ms_to_samples(spec.max_speech_ms);
        let mut segmenter = SpeechSegmenter::new(spec);

        // Ten minutes of a fan at 0.05 RMS, fed in 100 ms chunks
        let mut segments = Vec::new();
        for _ in 0..6000 {
            if let Some(segment) = segmenter.process(&[0.05; 1600]) {
                segments.push(segment.len());
            }
            assert!(segmenter.buffer.len() <= cap);
        }

        assert_eq!(segments.len(), 60);
        assert!(segments.iter().all(|&len| len == cap));
    }

    #[test]
    fn test_max_speech_must_exceed_min() {
        let inverted = ModelSpec {
            max_speech_ms: 200,
            ..ModelSpec::default()
        };
        assert!(matches!(inverted.validate(), Err(Error::WakeWord(_))));
    }
}
