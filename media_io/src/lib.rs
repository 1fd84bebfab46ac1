//! Local capture devices for huddle
//!
//! Microphone and screen capture streams and the lifecycle around them, plus
//! playback of remote audio.
//! Tracks are reference counted so every peer link shares the same track object.

pub mod audio;
mod capture;
pub mod devices;
pub mod local;
pub mod playback;
pub mod stream;

#[cfg(any(test, feature = "mock"))]
pub mod fake;

pub use audio::{AudioFrame, FRAME_DURATION};
pub use devices::{CpalDevices, MediaDevices};
pub use local::LocalMedia;
pub use playback::{PlaybackSource, Speaker};
pub use stream::{MediaStream, MediaTrack, TrackKind};

#[cfg(any(test, feature = "mock"))]
pub use devices::MockMediaDevices;
