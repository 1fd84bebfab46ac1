use media_io::MediaTrack;
use tokio::sync::mpsc;
use voice_core::{Error, LinkState, ParticipantId, Role, SignalPayload};

/// Serial number distinguishing successive links to the same participant.
pub type LinkId = u64;

/// What a link reports back to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEventKind {
    /// Outbound negotiation payload to relay to the remote side
    Signal(SignalPayload),
    /// Negotiation completed
    Connected,
    /// The link reached `Closed` on its own (failure or remote hang-up)
    Closed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvent {
    pub participant: ParticipantId,
    pub link: LinkId,
    pub kind: LinkEventKind,
}

/// Everything a factory needs to build one link.
#[derive(Debug, Clone)]
pub struct LinkContext {
    pub participant: ParticipantId,
    pub link: LinkId,
    pub role: Role,
    /// Local tracks to attach before negotiation starts
    pub tracks: Vec<MediaTrack>,
    pub events: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkContext {
    pub fn emit(&self, kind: LinkEventKind) {
        let _ = self.events.send(LinkEvent {
            participant: self.participant.clone(),
            link: self.link,
            kind,
        });
    }
}

/// One peer connection to a remote participant.
///
/// Methods never block: negotiation work runs behind the link and results come
/// back as [`LinkEvent`]s.
pub trait PeerLink: Send + Sync {
    fn role(&self) -> Role;

    fn state(&self) -> LinkState;

    /// Feed an inbound negotiation payload.
    fn signal(&self, payload: SignalPayload);

    fn add_track(&self, track: &MediaTrack);

    fn remove_track(&self, track: &MediaTrack);

    /// Stop negotiating and close. Does not emit `Closed`.
    fn close(&self);
}

/// Builds peer links for a concrete negotiation mechanism.
pub trait PeerLinkFactory: Send + Sync {
    fn create(&self, context: LinkContext) -> Result<Box<dyn PeerLink>, Error>;
}
