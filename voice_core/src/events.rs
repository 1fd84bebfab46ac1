use crate::{LinkState, ParticipantId, Phase};
use serde::{Deserialize, Serialize};

/// Opaque negotiation payload carried between peer links.
pub type SignalPayload = serde_json::Value;

/// Identity stamped onto a session when it connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub id: ParticipantId,
    pub username: String,
}

impl LocalIdentity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: ParticipantId::random(),
            username: username.into(),
        }
    }
}

/// A participant as announced by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: ParticipantId,
    pub username: String,
    /// Last state the participant announced, if any
    #[serde(flatten, default)]
    pub state: ParticipantPatch,
}

impl PeerInfo {
    pub fn new(id: ParticipantId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            state: ParticipantPatch::default(),
        }
    }

    pub fn with_state(mut self, state: ParticipantPatch) -> Self {
        self.state = state;
        self
    }
}

/// Partial update to a participant's observable state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_speaking: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_screen_sharing: Option<bool>,
}

impl ParticipantPatch {
    pub fn muted(is_muted: bool) -> Self {
        Self {
            is_muted: Some(is_muted),
            ..Default::default()
        }
    }

    pub fn screen_sharing(is_screen_sharing: bool) -> Self {
        Self {
            is_screen_sharing: Some(is_screen_sharing),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.is_muted.is_none() && self.is_speaking.is_none() && self.is_screen_sharing.is_none()
    }

    /// Fold a newer patch into this one; fields present in `newer` win.
    pub fn merge(&mut self, newer: &ParticipantPatch) {
        self.is_muted = newer.is_muted.or(self.is_muted);
        self.is_speaking = newer.is_speaking.or(self.is_speaking);
        self.is_screen_sharing = newer.is_screen_sharing.or(self.is_screen_sharing);
    }
}

/// Roster entry for a remote participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub username: String,
    pub is_muted: bool,
    pub is_speaking: bool,
    pub is_screen_sharing: bool,
    /// Mirror of the negotiation state of this participant's peer link.
    pub link_state: LinkState,
}

impl Participant {
    pub fn new(id: ParticipantId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            is_muted: false,
            is_speaking: false,
            is_screen_sharing: false,
            link_state: LinkState::Negotiating,
        }
    }

    /// Apply every field present in the patch.
    pub fn apply(&mut self, patch: &ParticipantPatch) {
        if let Some(muted) = patch.is_muted {
            self.is_muted = muted;
        }
        if let Some(speaking) = patch.is_speaking {
            self.is_speaking = speaking;
        }
        if let Some(sharing) = patch.is_screen_sharing {
            self.is_screen_sharing = sharing;
        }
    }
}

impl From<PeerInfo> for Participant {
    fn from(info: PeerInfo) -> Self {
        let mut participant = Participant::new(info.id, info.username);
        participant.apply(&info.state);
        participant
    }
}

/// Inbound events delivered by a signaling channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Participants already present, delivered once right after open
    RosterSnapshot { participants: Vec<PeerInfo> },
    ParticipantJoined { id: ParticipantId, username: String },
    ParticipantLeft { id: ParticipantId },
    /// Negotiation payload to forward to the matching peer link
    Signal {
        from: ParticipantId,
        payload: SignalPayload,
    },
    ParticipantUpdated {
        id: ParticipantId,
        patch: ParticipantPatch,
    },
}

impl SignalingEvent {
    /// The remote participant the event concerns, if any.
    pub fn participant(&self) -> Option<&ParticipantId> {
        match self {
            SignalingEvent::RosterSnapshot { .. } => None,
            SignalingEvent::ParticipantJoined { id, .. }
            | SignalingEvent::ParticipantLeft { id }
            | SignalingEvent::ParticipantUpdated { id, .. } => Some(id),
            SignalingEvent::Signal { from, .. } => Some(from),
        }
    }
}

/// Notifications emitted by the session controller for observers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PhaseChanged(Phase),
    ParticipantJoined(ParticipantId),
    ParticipantLeft(ParticipantId),
    LinkConnected(ParticipantId),
    /// A peer link closed without being asked to; the participant was dropped
    LinkFailed {
        participant: ParticipantId,
        reason: String,
    },
    MuteChanged(bool),
    ScreenShareChanged(bool),
    /// The relay went away and the session was torn down
    SignalingLost,
}
