use crate::capture;
use crate::stream::{MediaStream, MediaTrack, TrackKind};
use async_trait::async_trait;
use log::{debug, info};
use voice_core::{CaptureSource, Error};

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

/// Acquires and releases local capture streams.
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Request a microphone-only capture stream.
    async fn acquire_microphone(&self) -> Result<MediaStream, Error>;

    /// Request a display capture stream (video, no audio).
    async fn acquire_screen(&self) -> Result<MediaStream, Error>;

    /// Stop every track in the stream. Safe on an already stopped stream.
    fn release(&self, stream: &MediaStream) {
        let stopped = stream.stop();
        debug!(
            "Released {} stream {} ({} track(s) stopped)",
            stream.source(),
            stream.id(),
            stopped
        );
    }
}

/// Capture devices backed by the host audio system through cpal.
///
/// The microphone is opened on the configured input device or the host
/// default and captures until its stream is released. There is no display
/// capture backend, so screen requests are refused unless explicitly allowed,
/// in which case a video track without frames is issued.
pub struct CpalDevices {
    input_device: Option<String>,
    allow_screen_capture: bool,
}

impl CpalDevices {
    pub fn new() -> Self {
        Self {
            input_device: None,
            allow_screen_capture: false,
        }
    }

    /// Prefer the input device with this name. Empty means system default.
    pub fn with_input_device(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.input_device = if name.is_empty() { None } else { Some(name) };
        self
    }

    pub fn with_screen_capture(mut self, allow: bool) -> Self {
        self.allow_screen_capture = allow;
        self
    }
}

impl Default for CpalDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn acquire_microphone(&self) -> Result<MediaStream, Error> {
        let track = MediaTrack::new(TrackKind::Audio, "microphone");
        let input = capture::start(self.input_device.clone(), track.clone()).await?;
        let layout = if input.channels >= 2 { "stereo" } else { "mono" };
        info!(
            "Capturing microphone {} ({}, {} Hz)",
            input.name, layout, input.sample_rate
        );
        Ok(MediaStream::new(CaptureSource::Microphone, vec![track]))
    }

    async fn acquire_screen(&self) -> Result<MediaStream, Error> {
        if !self.allow_screen_capture {
            return Err(Error::PermissionDenied(CaptureSource::Screen));
        }
        info!("Acquired display capture");
        let track = MediaTrack::new(TrackKind::Video, "display");
        Ok(MediaStream::new(CaptureSource::Screen, vec![track]))
    }
}
