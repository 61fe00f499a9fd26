//! Karuna - hands-free voice client for a retrieval-backed assistant
//!
//! This library provides the pieces of the voice client:
//! - Microphone arbitration between wake word listening and conversation
//! - The conversation state machine and its controller
//! - Audio capture, playback and wake word detection
//! - The typed backend client and the shared transcript
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Terminal UI                       │
//! │   Status  │  Caption  │  Transcript  │  Keys         │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │              ConversationController                  │
//! │   Machine  │  MicArbiter  │  Player  │  Wake Word    │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                Assistant backend                     │
//! │   /greeting  │  /transcribe  │  /chat-voice  │  /chat │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod config;
pub mod conversation;
pub mod error;
pub mod session;
pub mod transcript;
pub mod voice;

pub use backend::{Backend, HttpBackend};
pub use config::Config;
pub use conversation::{Command, ConversationController, ConversationState, Notice, OverlayView};
pub use error::{Error, Result};
pub use session::SessionId;
pub use transcript::{TranscriptBridge, Turn};
