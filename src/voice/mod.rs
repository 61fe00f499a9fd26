//! Voice processing module
//!
//! Microphone arbitration, turn recording, wake word detection and playback.
//! Conversation speech recognition and synthesis happen on the backend.

mod capture;
mod mic;
mod playback;
mod player;
mod recorder;
mod segment;
mod verify;
mod wake_word;

pub use capture::{AudioCapture, SAMPLE_RATE, samples_to_wav};
pub use mic::{MicArbiter, MicOwner};
pub use playback::{AudioSink, AudioSource, Completion, CpalSink, decode_mp3, play_samples};
pub use player::{AudioHandle, AudioPlayer};
pub use recorder::{MicRecorder, Recorder};
pub use segment::{ModelSpec, SpeechSegmenter, rms};
pub use verify::{SpeechToText, Transcriber};
pub use wake_word::{
    Detection, KeywordEngine, KeywordSpec, PhraseSpotter, WakeWordDetector, match_phrase,
};
