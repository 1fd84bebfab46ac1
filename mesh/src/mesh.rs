use crate::link::{LinkContext, LinkEvent, LinkId, PeerLink, PeerLinkFactory};
use log::{debug, info, warn};
use media_io::{LocalMedia, MediaStream, MediaTrack};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use voice_core::{Error, ParticipantId, Role, SignalPayload};

/// Limits for signals that arrive before their participant's link exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalBuffer {
    pub max_per_peer: usize,
    pub ttl: Duration,
}

impl Default for SignalBuffer {
    fn default() -> Self {
        Self {
            max_per_peer: 32,
            ttl: Duration::from_secs(5),
        }
    }
}

struct LinkEntry {
    id: LinkId,
    link: Box<dyn PeerLink>,
    tracks: Vec<MediaTrack>,
}

/// The set of peer links of one session, at most one per participant.
pub struct PeerMesh {
    factory: Arc<dyn PeerLinkFactory>,
    events: mpsc::UnboundedSender<LinkEvent>,
    links: HashMap<ParticipantId, LinkEntry>,
    pending: HashMap<ParticipantId, VecDeque<(Instant, SignalPayload)>>,
    buffer: SignalBuffer,
    next_id: LinkId,
}

impl PeerMesh {
    /// Create an empty mesh. Link events for every link it creates arrive on the
    /// returned receiver.
    pub fn new(
        factory: Arc<dyn PeerLinkFactory>,
        buffer: SignalBuffer,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                factory,
                events,
                links: HashMap::new(),
                pending: HashMap::new(),
                buffer,
                next_id: 1,
            },
            events_rx,
        )
    }

    /// Create the link to `participant`, attaching every local track, including
    /// an active screen share. Signals buffered for the participant are replayed.
    pub fn create_link(
        &mut self,
        participant: &ParticipantId,
        role: Role,
        media: &LocalMedia,
    ) -> Result<LinkId, Error> {
        if self.links.contains_key(participant) {
            return Err(Error::DuplicateLink(participant.clone()));
        }

        let id = self.next_id;
        self.next_id += 1;
        let tracks = media.tracks();
        let link = self.factory.create(LinkContext {
            participant: participant.clone(),
            link: id,
            role,
            tracks: tracks.clone(),
            events: self.events.clone(),
        })?;
        info!(
            "Created {:?} link #{} to {} with {} track(s)",
            role,
            id,
            participant,
            tracks.len()
        );

        if let Some(queued) = self.pending.remove(participant) {
            let now = Instant::now();
            let fresh: Vec<_> = queued
                .into_iter()
                .filter(|(at, _)| now.duration_since(*at) <= self.buffer.ttl)
                .collect();
            debug!("Replaying {} buffered signal(s) to {}", fresh.len(), participant);
            for (_, payload) in fresh {
                link.signal(payload);
            }
        }

        self.links.insert(participant.clone(), LinkEntry { id, link, tracks });
        Ok(id)
    }

    /// Deliver an inbound payload. Payloads for participants without a link are
    /// held for a short while in case the link is about to be created.
    pub fn forward_signal(&mut self, participant: &ParticipantId, payload: SignalPayload) {
        if let Some(entry) = self.links.get(participant) {
            entry.link.signal(payload);
            return;
        }

        self.prune_pending();
        let max = self.buffer.max_per_peer;
        if max == 0 {
            warn!("Dropping signal from {}: no link", participant);
            return;
        }
        let queue = self.pending.entry(participant.clone()).or_default();
        if queue.len() >= max {
            warn!("Signal buffer for {} full, dropping oldest", participant);
            queue.pop_front();
        }
        queue.push_back((Instant::now(), payload));
        debug!(
            "Buffered signal from {} until its link exists ({} queued)",
            participant,
            queue.len()
        );
    }

    fn prune_pending(&mut self) {
        let ttl = self.buffer.ttl;
        let now = Instant::now();
        self.pending.retain(|participant, queue| {
            queue.retain(|(at, _)| now.duration_since(*at) <= ttl);
            if queue.is_empty() {
                debug!("Discarded expired signals for {}", participant);
            }
            !queue.is_empty()
        });
    }

    /// Add every track of `stream` to every open link.
    pub fn attach_track(&mut self, stream: &MediaStream) {
        for entry in self.links.values_mut() {
            for track in stream.tracks() {
                if !entry.tracks.iter().any(|t| t.same_track(track)) {
                    entry.link.add_track(track);
                    entry.tracks.push(track.clone());
                }
            }
        }
    }

    /// Remove every track of `stream` from every open link.
    pub fn detach_track(&mut self, stream: &MediaStream) {
        for entry in self.links.values_mut() {
            for track in stream.tracks() {
                if let Some(pos) = entry.tracks.iter().position(|t| t.same_track(track)) {
                    entry.link.remove_track(track);
                    entry.tracks.remove(pos);
                }
            }
        }
    }

    /// Close and forget the link to `participant`. Returns whether one existed.
    pub fn destroy_link(&mut self, participant: &ParticipantId) -> bool {
        self.pending.remove(participant);
        match self.links.remove(participant) {
            Some(entry) => {
                entry.link.close();
                info!("Destroyed link #{} to {}", entry.id, participant);
                true
            }
            None => false,
        }
    }

    pub fn destroy_all(&mut self) {
        for (participant, entry) in self.links.drain() {
            entry.link.close();
            debug!("Destroyed link #{} to {}", entry.id, participant);
        }
        self.pending.clear();
    }

    /// Whether `event` comes from the link currently registered for its participant.
    pub fn is_current(&self, event: &LinkEvent) -> bool {
        self.links
            .get(&event.participant)
            .map(|entry| entry.id == event.link)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn role(&self, participant: &ParticipantId) -> Option<Role> {
        self.links.get(participant).map(|e| e.link.role())
    }

    /// Local tracks currently attached to the link to `participant`.
    pub fn tracks(&self, participant: &ParticipantId) -> Vec<MediaTrack> {
        self.links
            .get(participant)
            .map(|e| e.tracks.clone())
            .unwrap_or_default()
    }

    /// Number of signals waiting for `participant`'s link.
    pub fn buffered(&self, participant: &ParticipantId) -> usize {
        self.pending.get(participant).map(VecDeque::len).unwrap_or(0)
    }
}

impl Drop for PeerMesh {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::RecordingLinkFactory;
    use media_io::TrackKind;
    use serde_json::json;
    use voice_core::{CaptureSource, LinkState};

    fn media() -> LocalMedia {
        LocalMedia::new(MediaStream::new(
            CaptureSource::Microphone,
            vec![MediaTrack::new(TrackKind::Audio, "mic")],
        ))
    }

    fn screen() -> MediaStream {
        MediaStream::new(
            CaptureSource::Screen,
            vec![MediaTrack::new(TrackKind::Video, "display")],
        )
    }

    fn mesh(factory: &RecordingLinkFactory) -> PeerMesh {
        PeerMesh::new(Arc::new(factory.clone()), SignalBuffer::default()).0
    }

    #[test]
    fn duplicate_link_is_rejected() {
        let factory = RecordingLinkFactory::new();
        let mut mesh = mesh(&factory);
        let u2 = ParticipantId::from("u2");

        mesh.create_link(&u2, Role::Initiator, &media()).unwrap();
        assert!(matches!(
            mesh.create_link(&u2, Role::Responder, &media()),
            Err(Error::DuplicateLink(id)) if id == u2
        ));
        assert_eq!(mesh.len(), 1);
        assert_eq!(mesh.role(&u2), Some(Role::Initiator));
    }

    #[test]
    fn early_signals_are_replayed_in_order() {
        let factory = RecordingLinkFactory::new();
        let mut mesh = mesh(&factory);
        let u3 = ParticipantId::from("u3");

        mesh.forward_signal(&u3, json!({ "n": 1 }));
        mesh.forward_signal(&u3, json!({ "n": 2 }));
        assert_eq!(mesh.buffered(&u3), 2);

        mesh.create_link(&u3, Role::Responder, &media()).unwrap();
        assert_eq!(mesh.buffered(&u3), 0);
        let link = factory.latest(&u3).unwrap();
        assert_eq!(link.signals(), vec![json!({ "n": 1 }), json!({ "n": 2 })]);

        mesh.forward_signal(&u3, json!({ "n": 3 }));
        assert_eq!(link.signals().len(), 3);
    }

    #[test]
    fn expired_signals_are_not_replayed() {
        let factory = RecordingLinkFactory::new();
        let (mut mesh, _rx) = PeerMesh::new(
            Arc::new(factory.clone()),
            SignalBuffer {
                max_per_peer: 4,
                ttl: Duration::ZERO,
            },
        );
        let u3 = ParticipantId::from("u3");
        mesh.forward_signal(&u3, json!({ "n": 1 }));
        std::thread::sleep(Duration::from_millis(5));

        mesh.create_link(&u3, Role::Responder, &media()).unwrap();
        assert!(factory.latest(&u3).unwrap().signals().is_empty());
    }

    #[test]
    fn buffer_is_bounded() {
        let factory = RecordingLinkFactory::new();
        let (mut mesh, _rx) = PeerMesh::new(
            Arc::new(factory.clone()),
            SignalBuffer {
                max_per_peer: 2,
                ttl: Duration::from_secs(60),
            },
        );
        let u3 = ParticipantId::from("u3");
        for n in 0..5 {
            mesh.forward_signal(&u3, json!({ "n": n }));
        }
        assert_eq!(mesh.buffered(&u3), 2);
        mesh.create_link(&u3, Role::Responder, &media()).unwrap();
        assert_eq!(
            factory.latest(&u3).unwrap().signals(),
            vec![json!({ "n": 3 }), json!({ "n": 4 })]
        );
    }

    #[test]
    fn screen_tracks_follow_share_lifecycle() {
        let factory = RecordingLinkFactory::new();
        let mut mesh = mesh(&factory);
        let mut local = media();
        let u2 = ParticipantId::from("u2");
        let u3 = ParticipantId::from("u3");
        let u4 = ParticipantId::from("u4");

        mesh.create_link(&u2, Role::Initiator, &local).unwrap();

        let share = screen();
        local.screen = Some(share.clone());
        mesh.attach_track(&share);
        mesh.create_link(&u3, Role::Initiator, &local).unwrap();

        let video = &share.tracks()[0];
        for id in [&u2, &u3] {
            assert!(factory.latest(id).unwrap().has_track(video));
            assert!(mesh.tracks(id).iter().any(|t| t.same_track(video)));
        }

        mesh.detach_track(&share);
        local.screen = None;
        mesh.create_link(&u4, Role::Initiator, &local).unwrap();

        for id in [&u2, &u3, &u4] {
            assert!(!factory.latest(id).unwrap().has_track(video));
        }
        assert_eq!(mesh.tracks(&u4).len(), 1);
    }

    #[test]
    fn destroy_is_idempotent_and_clears_buffer() {
        let factory = RecordingLinkFactory::new();
        let mut mesh = mesh(&factory);
        let u2 = ParticipantId::from("u2");
        let u5 = ParticipantId::from("u5");

        mesh.create_link(&u2, Role::Initiator, &media()).unwrap();
        mesh.forward_signal(&u5, json!({}));

        assert!(mesh.destroy_link(&u2));
        assert!(!mesh.destroy_link(&u2));
        assert_eq!(factory.latest(&u2).unwrap().state(), LinkState::Closed);

        mesh.destroy_all();
        assert!(mesh.is_empty());
        assert_eq!(mesh.buffered(&u5), 0);
    }

    #[test]
    fn stale_events_are_recognised() {
        let factory = RecordingLinkFactory::new();
        let mut mesh = mesh(&factory);
        let u2 = ParticipantId::from("u2");

        let first = mesh.create_link(&u2, Role::Initiator, &media()).unwrap();
        mesh.destroy_link(&u2);
        let second = mesh.create_link(&u2, Role::Initiator, &media()).unwrap();
        assert_ne!(first, second);

        let stale = LinkEvent {
            participant: u2.clone(),
            link: first,
            kind: crate::link::LinkEventKind::Connected,
        };
        assert!(!mesh.is_current(&stale));
        assert!(mesh.is_current(&LinkEvent {
            link: second,
            ..stale
        }));
    }
}
