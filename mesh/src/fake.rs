//! In-process links that record what the mesh asks of them.

use crate::link::{LinkContext, LinkEventKind, LinkId, PeerLink, PeerLinkFactory};
use media_io::MediaTrack;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use voice_core::{Error, LinkState, ParticipantId, Role, SignalPayload};

struct LinkRecord {
    context: LinkContext,
    state: LinkState,
    tracks: Vec<MediaTrack>,
    signals: Vec<SignalPayload>,
    closed_locally: bool,
}

/// Handle to one recorded link. Tests drive the link's side of negotiation
/// through it.
#[derive(Clone)]
pub struct RecordedLink {
    inner: Arc<Mutex<LinkRecord>>,
}

impl RecordedLink {
    fn lock(&self) -> MutexGuard<'_, LinkRecord> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn participant(&self) -> ParticipantId {
        self.lock().context.participant.clone()
    }

    pub fn id(&self) -> LinkId {
        self.lock().context.link
    }

    pub fn role(&self) -> Role {
        self.lock().context.role
    }

    pub fn state(&self) -> LinkState {
        self.lock().state
    }

    /// Payloads delivered to the link, in order.
    pub fn signals(&self) -> Vec<SignalPayload> {
        self.lock().signals.clone()
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.lock().tracks.clone()
    }

    pub fn has_track(&self, track: &MediaTrack) -> bool {
        self.lock().tracks.iter().any(|t| t.same_track(track))
    }

    pub fn closed_locally(&self) -> bool {
        self.lock().closed_locally
    }

    /// Produce an outbound payload as if negotiation had generated one.
    pub fn emit_signal(&self, payload: SignalPayload) {
        let record = self.lock();
        if record.state != LinkState::Closed {
            record.context.emit(LinkEventKind::Signal(payload));
        }
    }

    /// Finish negotiation.
    pub fn connect(&self) {
        let mut record = self.lock();
        if record.state.can_transition_to(LinkState::Connected) {
            record.state = LinkState::Connected;
            record.context.emit(LinkEventKind::Connected);
        }
    }

    /// Fail the link as a transport error would.
    pub fn fail(&self, reason: &str) {
        let mut record = self.lock();
        if record.state != LinkState::Closed {
            record.state = LinkState::Closed;
            record.context.emit(LinkEventKind::Closed {
                reason: reason.to_string(),
            });
        }
    }
}

impl PeerLink for RecordedLink {
    fn role(&self) -> Role {
        RecordedLink::role(self)
    }

    fn state(&self) -> LinkState {
        RecordedLink::state(self)
    }

    fn signal(&self, payload: SignalPayload) {
        let mut record = self.lock();
        if record.state != LinkState::Closed {
            record.signals.push(payload);
        }
    }

    fn add_track(&self, track: &MediaTrack) {
        let mut record = self.lock();
        if !record.tracks.iter().any(|t| t.same_track(track)) {
            record.tracks.push(track.clone());
        }
    }

    fn remove_track(&self, track: &MediaTrack) {
        self.lock().tracks.retain(|t| !t.same_track(track));
    }

    fn close(&self) {
        let mut record = self.lock();
        record.state = LinkState::Closed;
        record.closed_locally = true;
    }
}

#[derive(Default)]
struct FactoryState {
    links: Vec<RecordedLink>,
    refuse: HashMap<ParticipantId, String>,
}

/// Link factory that keeps a handle to every link it builds.
#[derive(Clone, Default)]
pub struct RecordingLinkFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl RecordingLinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FactoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `create` for `participant` fail.
    pub fn refuse(&self, participant: &ParticipantId, reason: &str) {
        self.lock()
            .refuse
            .insert(participant.clone(), reason.to_string());
    }

    /// Every link created so far, oldest first.
    pub fn links(&self) -> Vec<RecordedLink> {
        self.lock().links.clone()
    }

    pub fn created(&self) -> usize {
        self.lock().links.len()
    }

    /// The most recent link to `participant`.
    pub fn latest(&self, participant: &ParticipantId) -> Option<RecordedLink> {
        self.lock()
            .links
            .iter()
            .rev()
            .find(|l| &l.participant() == participant)
            .cloned()
    }

    /// Links that are neither closed locally nor failed.
    pub fn open_links(&self) -> Vec<RecordedLink> {
        self.links()
            .into_iter()
            .filter(|l| l.state() != LinkState::Closed)
            .collect()
    }
}

impl PeerLinkFactory for RecordingLinkFactory {
    fn create(&self, context: LinkContext) -> Result<Box<dyn PeerLink>, Error> {
        let mut state = self.lock();
        if let Some(reason) = state.refuse.remove(&context.participant) {
            return Err(Error::NegotiationFailed {
                participant: context.participant,
                reason,
            });
        }
        let link = RecordedLink {
            inner: Arc::new(Mutex::new(LinkRecord {
                tracks: context.tracks.clone(),
                context,
                state: LinkState::Negotiating,
                signals: Vec::new(),
                closed_locally: false,
            })),
        };
        state.links.push(link.clone());
        Ok(Box::new(link))
    }
}
