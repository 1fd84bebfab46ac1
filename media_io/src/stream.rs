use crate::audio::AudioFrame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;
use voice_core::CaptureSource;

/// Kind of media a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    /// `true` while the capture source is producing
    live: watch::Sender<bool>,
    frames: broadcast::Sender<AudioFrame>,
}

/// Frames a slow consumer may fall behind before it starts skipping.
const FRAME_BACKLOG: usize = 50;

/// Handle to one captured media track.
///
/// Clones share the same underlying track, so toggling `enabled` or stopping
/// through any clone is observed by every holder.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        let (live, _) = watch::channel(true);
        let (frames, _) = broadcast::channel(FRAME_BACKLOG);
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4().to_string(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                live,
                frames,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        *self.inner.live.borrow()
    }

    /// Stop the track. Returns `true` only for the call that actually stopped it.
    pub fn stop(&self) -> bool {
        self.inner.live.send_if_modified(|live| {
            let was_live = *live;
            *live = false;
            was_live
        })
    }

    /// Resolves once the track has ended, whether stopped locally or by its source.
    pub async fn ended(&self) {
        let mut rx = self.inner.live.subscribe();
        let _ = rx.wait_for(|live| !*live).await;
    }

    /// Receive the frames the capture source publishes from now on.
    pub fn frames(&self) -> broadcast::Receiver<AudioFrame> {
        self.inner.frames.subscribe()
    }

    /// Hand a captured frame to every subscriber. A disabled track publishes
    /// silence in its place and a stopped one publishes nothing. Returns the
    /// number of subscribers reached.
    pub fn publish(&self, mut frame: AudioFrame) -> usize {
        if !self.is_live() {
            return 0;
        }
        if !self.is_enabled() {
            frame.silence();
        }
        self.inner.frames.send(frame).unwrap_or(0)
    }

    /// Whether both handles refer to the same underlying track.
    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.same_track(other)
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// A set of tracks captured together from one source.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaStream {
    id: String,
    source: CaptureSource,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(source: CaptureSource, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source,
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> CaptureSource {
        self.source
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    /// Stop every track. Returns how many tracks this call stopped.
    pub fn stop(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }

    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(MediaTrack::is_live)
    }

    /// Resolves when the first track of the stream ends.
    pub async fn ended(&self) {
        if let Some(track) = self.tracks.first() {
            track.ended().await;
        }
    }
}
