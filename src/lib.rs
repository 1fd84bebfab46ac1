//! huddle - voice and screen-share sessions for chat channels
//!
//! Re-exports the session API and wires the concrete capture, relay and
//! WebRTC implementations together from [`Settings`].

use log::warn;
use std::sync::Arc;
use std::time::Duration;

pub use media_io::{
    CpalDevices, LocalMedia, MediaDevices, MediaStream, MediaTrack, Speaker, TrackKind,
};
pub use mesh::{PeerLinkFactory, PeerMesh, SignalBuffer, WebRtcLinkFactory};
pub use session::{ControllerConfig, ParticipantRoster, SessionSnapshot, VoiceSessionController};
pub use settings_manager::{ConfigManager, Settings, SignalBufferSettings};
pub use signaling::{Relay, SignalingChannel, WsSignalingChannel};
pub use voice_core::{
    CaptureSource, ChannelId, Error, Participant, ParticipantId, ParticipantPatch, Phase,
    ScreenShare, SessionEvent,
};

/// Signal buffer limits as configured.
pub fn signal_buffer(settings: &SignalBufferSettings) -> SignalBuffer {
    SignalBuffer {
        max_per_peer: settings.max_per_peer,
        ttl: Duration::from_millis(settings.ttl_ms),
    }
}

/// Build a controller using the system microphone and speaker, the WebSocket
/// relay at `settings.relay_url` and WebRTC peer links.
///
/// A missing output device is not fatal; the session then runs without
/// remote audio.
pub fn controller_from_settings(settings: &Settings) -> Result<VoiceSessionController, Error> {
    let devices = CpalDevices::new()
        .with_input_device(settings.audio_input_device.clone())
        .with_screen_capture(settings.screen_share);
    let signaling = WsSignalingChannel::new(settings.relay_url.clone());
    let mut links = WebRtcLinkFactory::new(settings.ice_servers.clone())?;

    let output = Some(settings.audio_output_device.as_str()).filter(|name| !name.is_empty());
    match Speaker::open(output) {
        Ok(speaker) => links = links.with_speaker(speaker),
        Err(e) => warn!("Remote audio disabled: {}", e),
    }

    Ok(VoiceSessionController::with_config(
        Arc::new(devices),
        Arc::new(signaling),
        Arc::new(links),
        ControllerConfig {
            username: settings.username.clone(),
            signal_buffer: signal_buffer(&settings.signal_buffer),
        },
    ))
}
