//! Microphone input
//!
//! Opens the default input device at 16 kHz and collects mono `f32` samples
//! into a shared buffer. Devices that only offer stereo at that rate are
//! downmixed in the stream callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig, SupportedStreamConfigRange};

use crate::{Error, Result};

/// Capture rate expected by the segmenter and the backend
pub const SAMPLE_RATE: u32 = 16000;

/// Backend messages that mean the OS refused access rather than a hiccup
const DENIAL_MARKERS: [&str; 3] = ["permission", "denied", "not authorized"];

/// One open input device and the samples it has delivered
pub struct AudioCapture {
    device: Device,
    config: StreamConfig,
    buffer: Arc<Mutex<Vec<f32>>>,
    faulted: Arc<AtomicBool>,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Open the default input device
    ///
    /// # Errors
    ///
    /// Returns `Error::MicPermission` if there is no usable input device or
    /// access is refused, `Error::Audio` for other device failures
    pub fn new() -> Result<Self> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| Error::MicPermission("no input device available".to_string()))?;

        let ranges: Vec<SupportedStreamConfigRange> = device
            .supported_input_configs()
            .map_err(|e| match e {
                cpal::SupportedStreamConfigsError::DeviceNotAvailable => {
                    Error::MicPermission(e.to_string())
                }
                other => classify(other.to_string()),
            })?
            .collect();

        let config = pick_config(&ranges).ok_or_else(|| {
            Error::MicPermission(format!("input device cannot record at {SAMPLE_RATE} Hz"))
        })?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            channels = config.channels,
            "input device opened"
        );

        Ok(Self {
            device,
            config,
            buffer: Arc::new(Mutex::new(Vec::new())),
            faulted: Arc::new(AtomicBool::new(false)),
            stream: None,
        })
    }

    /// Start delivering samples into the buffer
    ///
    /// # Errors
    ///
    /// Returns `Error::MicPermission` if the device went away or access was
    /// refused, `Error::Audio` if the stream cannot start for another reason
    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let buffer = Arc::clone(&self.buffer);
        let faulted = Arc::clone(&self.faulted);
        let channels = usize::from(self.config.channels.max(1));
        self.faulted.store(false, Ordering::SeqCst);

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let Ok(mut buf) = buffer.lock() else {
                        return;
                    };
                    if channels == 1 {
                        buf.extend_from_slice(data);
                    } else {
                        #[allow(clippy::cast_precision_loss)]
                        buf.extend(
                            data.chunks(channels)
                                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
                        );
                    }
                },
                move |err| {
                    faulted.store(true, Ordering::SeqCst);
                    tracing::error!(error = %err, "input stream error");
                },
                None,
            )
            .map_err(|e| match e {
                cpal::BuildStreamError::DeviceNotAvailable => Error::MicPermission(e.to_string()),
                other => classify(other.to_string()),
            })?;

        stream.play().map_err(|e| match e {
            cpal::PlayStreamError::DeviceNotAvailable => Error::MicPermission(e.to_string()),
            other => classify(other.to_string()),
        })?;
        self.stream = Some(stream);

        tracing::debug!("input stream started");
        Ok(())
    }

    /// Close the stream; buffered samples are kept until drained
    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("input stream closed");
        }
    }

    /// Take every sample delivered so far
    #[must_use]
    pub fn drain(&self) -> Vec<f32> {
        self.buffer
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }

    /// Whether the stream is open
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }

    /// Whether the stream reported an error since it started
    #[must_use]
    pub fn has_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }
}

/// Prefer mono, otherwise the fewest channels that support the capture rate
fn pick_config(ranges: &[SupportedStreamConfigRange]) -> Option<StreamConfig> {
    let rate = SampleRate(SAMPLE_RATE);
    ranges
        .iter()
        .filter(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .min_by_key(|c| c.channels())
        .map(|c| c.with_sample_rate(rate).config())
}

/// Sort a backend-specific failure into denial or transient
fn classify(message: String) -> Error {
    let lower = message.to_lowercase();
    if DENIAL_MARKERS.iter().any(|marker| lower.contains(marker)) {
        Error::MicPermission(message)
    } else {
        Error::Audio(message)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_pcm16(sample: f32) -> i16 {
    (sample * f32::from(i16::MAX)).clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

/// Encode mono samples as a 16-bit PCM WAV file
///
/// # Errors
///
/// Returns `Error::Audio` if encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let wav_err = |e: hound::Error| Error::Audio(format!("wav encoding failed: {e}"));

    let mut out = std::io::Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    let mut writer = hound::WavWriter::new(&mut out, spec).map_err(wav_err)?;
    for &sample in samples {
        writer.write_sample(to_pcm16(sample)).map_err(wav_err)?;
    }
    writer.finalize().map_err(wav_err)?;

    Ok(out.into_inner())
}
