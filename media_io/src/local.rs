use crate::devices::MediaDevices;
use crate::stream::{MediaStream, MediaTrack};

/// Local capture owned by an active session: the microphone, plus the screen
/// while sharing.
#[derive(Debug, Clone)]
pub struct LocalMedia {
    pub microphone: MediaStream,
    pub screen: Option<MediaStream>,
}

impl LocalMedia {
    pub fn new(microphone: MediaStream) -> Self {
        Self {
            microphone,
            screen: None,
        }
    }

    /// Every track a newly created peer link has to carry.
    pub fn tracks(&self) -> Vec<MediaTrack> {
        let mut tracks = self.microphone.tracks().to_vec();
        if let Some(screen) = &self.screen {
            tracks.extend(screen.tracks().iter().cloned());
        }
        tracks
    }

    /// Release every stream through `devices`.
    pub fn release(self, devices: &dyn MediaDevices) {
        if let Some(screen) = &self.screen {
            devices.release(screen);
        }
        devices.release(&self.microphone);
    }
}
