//! Voice conversation loop
//!
//! [`machine`] holds the transition rules, [`controller`] runs them against
//! the microphone, the player and the backend, and [`view`] is what the
//! overlay shows.

pub mod controller;
pub mod machine;
pub mod view;

pub use controller::{Command, ConversationController};
pub use machine::{
    CONNECTION_ERROR, ConversationState, Effect, Event, LivenessToken, MIC_ERROR, Machine,
    NOT_HEARD, Outcome,
};
pub use view::{Notice, OverlayView};
