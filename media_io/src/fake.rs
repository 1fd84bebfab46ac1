//! Scriptable in-memory capture devices for tests.

use crate::devices::MediaDevices;
use crate::stream::{MediaStream, MediaTrack, TrackKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{watch, Notify};
use voice_core::{CaptureSource, Error};

/// Outcome of a scripted permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Allow,
    Deny,
    Unavailable,
}

/// Keeps a microphone request suspended until opened.
pub struct Gate {
    tx: watch::Sender<bool>,
}

impl Gate {
    pub fn open(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Default)]
struct Counters {
    mic_requests: AtomicUsize,
    screen_requests: AtomicUsize,
    released_tracks: AtomicUsize,
}

/// Capture devices whose permission prompts are scripted by the test.
pub struct FakeDevices {
    microphone: Mutex<Grant>,
    screen: Mutex<Grant>,
    gate: Mutex<Option<watch::Receiver<bool>>>,
    issued: Mutex<Vec<MediaStream>>,
    counters: Counters,
    requested: Notify,
}

impl FakeDevices {
    pub fn new() -> Self {
        Self {
            microphone: Mutex::new(Grant::Allow),
            screen: Mutex::new(Grant::Allow),
            gate: Mutex::new(None),
            issued: Mutex::new(Vec::new()),
            counters: Counters::default(),
            requested: Notify::new(),
        }
    }

    pub fn with_microphone(self, grant: Grant) -> Self {
        *self.microphone.lock().unwrap_or_else(|e| e.into_inner()) = grant;
        self
    }

    pub fn with_screen(self, grant: Grant) -> Self {
        *self.screen.lock().unwrap_or_else(|e| e.into_inner()) = grant;
        self
    }

    pub fn set_screen(&self, grant: Grant) {
        *self.screen.lock().unwrap_or_else(|e| e.into_inner()) = grant;
    }

    /// Hold every following microphone request until the gate opens.
    pub fn hold_microphone(&self) -> Gate {
        let (tx, rx) = watch::channel(false);
        *self.gate.lock().unwrap_or_else(|e| e.into_inner()) = Some(rx);
        Gate { tx }
    }

    /// Wait until a capture request has reached the device.
    pub async fn requested(&self) {
        self.requested.notified().await;
    }

    pub fn microphone_requests(&self) -> usize {
        self.counters.mic_requests.load(Ordering::SeqCst)
    }

    pub fn screen_requests(&self) -> usize {
        self.counters.screen_requests.load(Ordering::SeqCst)
    }

    /// Tracks stopped through `release` (a track stopped twice counts once).
    pub fn released_tracks(&self) -> usize {
        self.counters.released_tracks.load(Ordering::SeqCst)
    }

    /// Tracks handed out that are still capturing.
    pub fn live_tracks(&self) -> usize {
        self.issued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .flat_map(|s| s.tracks().iter())
            .filter(|t| t.is_live())
            .count()
    }

    /// Every stream issued so far, in order.
    pub fn issued(&self) -> Vec<MediaStream> {
        self.issued.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn issue(&self, source: CaptureSource, kind: TrackKind, label: &str) -> MediaStream {
        let stream = MediaStream::new(source, vec![MediaTrack::new(kind, label)]);
        self.issued.lock().unwrap_or_else(|e| e.into_inner()).push(stream.clone());
        stream
    }
}

impl Default for FakeDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire_microphone(&self) -> Result<MediaStream, Error> {
        self.counters.mic_requests.fetch_add(1, Ordering::SeqCst);
        self.requested.notify_one();

        let gate = self.gate.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|open| *open).await;
        }

        let grant = *self.microphone.lock().unwrap_or_else(|e| e.into_inner());
        match grant {
            Grant::Allow => Ok(self.issue(CaptureSource::Microphone, TrackKind::Audio, "fake mic")),
            Grant::Deny => Err(Error::PermissionDenied(CaptureSource::Microphone)),
            Grant::Unavailable => Err(Error::DeviceUnavailable("no fake microphone".into())),
        }
    }

    async fn acquire_screen(&self) -> Result<MediaStream, Error> {
        self.counters.screen_requests.fetch_add(1, Ordering::SeqCst);
        self.requested.notify_one();

        let grant = *self.screen.lock().unwrap_or_else(|e| e.into_inner());
        match grant {
            Grant::Allow => Ok(self.issue(CaptureSource::Screen, TrackKind::Video, "fake display")),
            Grant::Deny | Grant::Unavailable => Err(Error::PermissionDenied(CaptureSource::Screen)),
        }
    }

    fn release(&self, stream: &MediaStream) {
        let stopped = stream.stop();
        self.counters
            .released_tracks
            .fetch_add(stopped, Ordering::SeqCst);
    }
}
