//! Single-channel audio player with cancel-on-replace completion

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use url::Url;

use super::playback::{AudioSink, AudioSource, Completion};
use crate::{Error, Result};

/// Snapshot of the loaded source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioHandle {
    /// Loaded source
    pub source: Url,
    /// Whether it is playing right now
    pub is_playing: bool,
}

/// Plays one source at a time
///
/// Each `load`, `play` and `stop` opens a new cycle. A completion only fires
/// if its cycle is still current, so replacing or stopping a source drops
/// the previous completion and nothing fires twice.
pub struct AudioPlayer {
    sink: Box<dyn AudioSink>,
    source: Option<AudioSource>,
    on_complete: Option<Completion>,
    cycle: Arc<AtomicU64>,
    playing: Arc<AtomicBool>,
}

impl AudioPlayer {
    /// Create a player on top of an output sink
    #[must_use]
    pub fn new(sink: Box<dyn AudioSink>) -> Self {
        Self {
            sink,
            source: None,
            on_complete: None,
            cycle: Arc::new(AtomicU64::new(0)),
            playing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the loaded source, cancelling whatever was pending
    pub fn load(&mut self, source: AudioSource) {
        self.cancel();
        self.on_complete = None;
        tracing::debug!(scheme = source.url().scheme(), "audio source loaded");
        self.source = Some(source);
    }

    /// Register the callback for the next play cycle
    pub fn on_complete(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.on_complete = Some(Box::new(callback));
    }

    /// Play the loaded source
    ///
    /// # Errors
    ///
    /// Returns error if nothing is loaded or the sink refuses to start
    pub fn play(&mut self) -> Result<()> {
        self.cancel();

        let source = self
            .source
            .as_ref()
            .ok_or_else(|| Error::Audio("no audio source loaded".to_string()))?;

        let cycle = self.cycle.load(Ordering::SeqCst);
        let current = Arc::clone(&self.cycle);
        let playing = Arc::clone(&self.playing);
        let callback = self.on_complete.take();

        self.playing.store(true, Ordering::SeqCst);
        let done: Completion = Box::new(move || {
            // Consume the cycle so a late duplicate cannot fire again
            if current
                .compare_exchange(cycle, cycle + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                playing.store(false, Ordering::SeqCst);
                if let Some(callback) = callback {
                    callback();
                }
            } else {
                tracing::trace!(cycle, "stale playback completion dropped");
            }
        });

        if let Err(e) = self.sink.start(source, done) {
            self.playing.store(false, Ordering::SeqCst);
            return Err(e);
        }

        tracing::debug!(cycle, "playback started");
        Ok(())
    }

    /// Halt playback and discard the pending completion
    pub fn stop(&mut self) {
        if self.is_playing() {
            tracing::debug!("playback stopped");
        }
        self.cancel();
        self.on_complete = None;
    }

    /// Whether a source is playing
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    /// The loaded source, if any
    #[must_use]
    pub fn handle(&self) -> Option<AudioHandle> {
        self.source.as_ref().map(|source| AudioHandle {
            source: source.url().clone(),
            is_playing: self.is_playing(),
        })
    }

    fn cancel(&mut self) {
        if self.playing.swap(false, Ordering::SeqCst) {
            self.sink.halt();
        }
        self.cycle.fetch_add(1, Ordering::SeqCst);
    }
}
