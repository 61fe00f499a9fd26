//! Audio playback to speakers

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use base64::Engine as _;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, StreamConfig};
use url::Url;

use crate::{Error, Result};

/// Rate assumed for decoded frames that do not report one
const FALLBACK_SAMPLE_RATE: u32 = 24000;

/// Callback run once when a source finished playing
pub type Completion = Box<dyn FnOnce() + Send + 'static>;

/// Where answer audio lives: a `data:` URL or an `http(s)` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSource(Url);

impl AudioSource {
    /// Parse an audio reference returned by the backend
    ///
    /// # Errors
    ///
    /// Returns error if the reference is not a data or http(s) URL
    pub fn parse(reference: &str) -> Result<Self> {
        let url = Url::parse(reference.trim())
            .map_err(|e| Error::Audio(format!("invalid audio URL: {e}")))?;
        Self::try_from(url)
    }

    /// The underlying URL
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.0
    }

    /// Resolve the source to encoded audio bytes
    ///
    /// Blocks on the network for remote sources; call from a playback thread.
    ///
    /// # Errors
    ///
    /// Returns error if a data URL is malformed or a download fails
    pub fn fetch(&self) -> Result<Vec<u8>> {
        match self.0.scheme() {
            "data" => decode_data_url(self.0.as_str()),
            _ => {
                let response = reqwest::blocking::get(self.0.clone())?.error_for_status()?;
                Ok(response.bytes()?.to_vec())
            }
        }
    }
}

impl TryFrom<Url> for AudioSource {
    type Error = Error;

    fn try_from(url: Url) -> Result<Self> {
        match url.scheme() {
            "data" | "http" | "https" => Ok(Self(url)),
            other => Err(Error::Audio(format!("unsupported audio scheme: {other}"))),
        }
    }
}

/// Decode the payload of a `data:` URL
fn decode_data_url(url: &str) -> Result<Vec<u8>> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| Error::Audio("not a data URL".to_string()))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| Error::Audio("data URL has no payload".to_string()))?;

    if meta.ends_with(";base64") {
        base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| Error::Audio(format!("invalid base64 audio: {e}")))
    } else {
        Ok(urlencoding::decode_binary(payload.as_bytes()).into_owned())
    }
}

/// Output device that plays one source at a time
pub trait AudioSink {
    /// Begin playing `source`; `done` runs when it finishes or fails
    ///
    /// # Errors
    ///
    /// Returns error if playback cannot be started at all
    fn start(&mut self, source: &AudioSource, done: Completion) -> Result<()>;

    /// Cut the current source short; its completion must not run
    fn halt(&mut self);
}

/// [`AudioSink`] over the default output device
///
/// Each source is fetched, decoded and played on its own thread since cpal
/// streams cannot move between threads.
#[derive(Default)]
pub struct CpalSink {
    halt: Option<Arc<AtomicBool>>,
}

impl CpalSink {
    /// Check that an output device exists
    ///
    /// # Errors
    ///
    /// Returns error if no output device is available
    pub fn new() -> Result<Self> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            "audio playback initialized"
        );

        Ok(Self::default())
    }
}

impl AudioSink for CpalSink {
    fn start(&mut self, source: &AudioSource, done: Completion) -> Result<()> {
        self.halt();

        let halt = Arc::new(AtomicBool::new(false));
        self.halt = Some(Arc::clone(&halt));
        let source = source.clone();

        std::thread::Builder::new()
            .name("karuna-playback".to_string())
            .spawn(move || {
                let result = source
                    .fetch()
                    .and_then(|bytes| decode_mp3(&bytes))
                    .and_then(|(samples, rate)| play_samples(&samples, rate, &halt));

                if let Err(e) = result {
                    tracing::warn!(error = %e, "playback failed");
                }
                if !halt.load(Ordering::SeqCst) {
                    done();
                }
            })?;

        Ok(())
    }

    fn halt(&mut self) {
        if let Some(halt) = self.halt.take() {
            halt.store(true, Ordering::SeqCst);
        }
    }
}

/// Read position shared between the caller and the output callback
struct Playhead {
    samples: Vec<f32>,
    next: AtomicUsize,
}

impl Playhead {
    /// Next sample, or `None` once everything was handed out
    fn advance(&self) -> Option<f32> {
        let at = self.next.fetch_add(1, Ordering::Relaxed);
        self.samples.get(at).copied()
    }
}

/// Play mono samples on the default output device, blocking until done
///
/// Returns early once `halt` is set.
///
/// # Errors
///
/// Returns error if the output stream cannot be opened
pub fn play_samples(samples: &[f32], sample_rate: u32, halt: &AtomicBool) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }

    let (device, config) = open_output(sample_rate)?;
    let output_rate = config.sample_rate.0;
    let channels = usize::from(config.channels.max(1));

    let playhead = Arc::new(Playhead {
        samples: resample(samples, sample_rate, output_rate)?,
        next: AtomicUsize::new(0),
    });
    let total = playhead.samples.len();
    let (drained_tx, drained) = std::sync::mpsc::channel::<()>();

    let feed = Arc::clone(&playhead);
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let value = feed.advance().unwrap_or_else(|| {
                        let _ = drained_tx.send(());
                        0.0
                    });
                    frame.fill(value);
                }
            },
            |err| tracing::error!(error = %err, "output stream error"),
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;
    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    // Bound the wait in case the device stops calling back
    let millis = u64::try_from(total)
        .unwrap_or(u64::MAX)
        .saturating_mul(1000)
        / u64::from(output_rate.max(1));
    let budget = Duration::from_millis(millis.saturating_add(500));
    let started = Instant::now();
    let mut completed = false;
    while !halt.load(Ordering::SeqCst) && started.elapsed() < budget {
        if drained.recv_timeout(Duration::from_millis(50)).is_ok() {
            completed = true;
            break;
        }
    }

    if completed {
        // Let the device drain its last buffer
        std::thread::sleep(Duration::from_millis(100));
    }
    drop(stream);
    tracing::debug!(samples = total, output_rate, completed, "playback finished");

    Ok(())
}

/// Pick an output config for `sample_rate`, falling back to the device default
fn open_output(sample_rate: u32) -> Result<(Device, StreamConfig)> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device".to_string()))?;

    let exact = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .filter(|c| c.channels() <= 2 && c.sample_format() == cpal::SampleFormat::F32)
        .find(|c| {
            c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        });

    let config = match exact {
        Some(c) => c.with_sample_rate(SampleRate(sample_rate)).config(),
        None => device
            .default_output_config()
            .map_err(|e| Error::Audio(e.to_string()))?
            .config(),
    };

    tracing::trace!(
        sample_rate = config.sample_rate.0,
        channels = config.channels,
        "output config selected"
    );

    Ok((device, config))
}

/// Input frames per resampler pass
const RESAMPLE_CHUNK: usize = 1024;

/// Convert mono samples between rates, keeping the duration
///
/// # Errors
///
/// Returns `Error::Audio` if the resampler rejects the rates
fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    if samples.is_empty() || from == to {
        return Ok(samples.to_vec());
    }

    let wanted = u64::try_from(samples.len())
        .unwrap_or(u64::MAX)
        .saturating_mul(u64::from(to))
        / u64::from(from.max(1));
    let wanted = usize::try_from(wanted).unwrap_or(usize::MAX);

    let mut resampler = FftFixedIn::<f32>::new(
        usize::try_from(from).unwrap_or(usize::MAX),
        usize::try_from(to).unwrap_or(usize::MAX),
        RESAMPLE_CHUNK,
        2,
        1,
    )
    .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;
    let delay = resampler.output_delay();

    let silence = [0.0_f32; RESAMPLE_CHUNK];
    let mut padded = [0.0_f32; RESAMPLE_CHUNK];
    let mut chunks = samples.chunks(RESAMPLE_CHUNK);
    let mut output = Vec::with_capacity(wanted.saturating_add(delay));

    // Keep feeding zeros after the input to flush the filter delay
    while output.len() < wanted.saturating_add(delay) {
        let input: &[f32] = match chunks.next() {
            Some(chunk) if chunk.len() == RESAMPLE_CHUNK => chunk,
            Some(tail) => {
                padded[..tail.len()].copy_from_slice(tail);
                &padded
            }
            None => &silence,
        };
        let pass = resampler
            .process(&[input], None)
            .map_err(|e| Error::Audio(format!("resampling failed: {e}")))?;
        output.extend_from_slice(&pass[0]);
    }

    Ok(output[delay..delay + wanted].to_vec())
}

/// Decode MP3 bytes to mono f32 samples and their sample rate
///
/// # Errors
///
/// Returns error if the data is not valid MP3
pub fn decode_mp3(mp3_data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(std::io::Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = None;

    loop {
        let frame = match decoder.next_frame() {
            Ok(frame) => frame,
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        };

        if sample_rate.is_none() {
            sample_rate = u32::try_from(frame.sample_rate).ok().filter(|r| *r > 0);
        }

        // Downmix interleaved frames to mono
        let channels = frame.channels.max(1);
        #[allow(clippy::cast_precision_loss)]
        samples.extend(frame.data.chunks(channels).map(|pcm| {
            pcm.iter().map(|&s| f32::from(s) / 32768.0).sum::<f32>() / pcm.len() as f32
        }));
    }

    Ok((samples, sample_rate.unwrap_or(FALLBACK_SAMPLE_RATE)))
}
