//! Voice session orchestration for huddle
//!
//! [`VoiceSessionController`] owns one session's lifecycle: it acquires the
//! microphone, joins the relay, turns relay notifications into peer links and
//! keeps the [`ParticipantRoster`] in step with them.

pub mod controller;
pub mod roster;

pub use controller::{ControllerConfig, SessionSnapshot, VoiceSessionController};
pub use roster::ParticipantRoster;
