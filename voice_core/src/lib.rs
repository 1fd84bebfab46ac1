//! Shared types for huddle voice sessions
//!
//! Identifiers, the unified error type and the event vocabulary that the
//! media, signaling, mesh and session crates exchange.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod events;

pub use events::{
    LocalIdentity, Participant, ParticipantPatch, PeerInfo, SessionEvent, SignalPayload,
    SignalingEvent,
};

/// Identifier of a participant as assigned by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a voice channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capture source a permission prompt was raised for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureSource {
    Microphone,
    Screen,
}

impl std::fmt::Display for CaptureSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureSource::Microphone => write!(f, "microphone"),
            CaptureSource::Screen => write!(f, "screen capture"),
        }
    }
}

/// Which side of a peer pairing starts negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Responder,
}

/// Negotiation state of a single peer link. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    Negotiating,
    Connected,
    Closed,
}

impl LinkState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: LinkState) -> bool {
        matches!(
            (self, next),
            (LinkState::Negotiating, LinkState::Connected)
                | (LinkState::Negotiating, LinkState::Closed)
                | (LinkState::Connected, LinkState::Closed)
        )
    }
}

/// Lifecycle phase of the voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Phase {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

/// Screen-share sub-state, only meaningful while connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ScreenShare {
    #[default]
    Off,
    Requesting,
    Active,
}

/// Unified error type for voice sessions.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Permission denied for {0}")]
    PermissionDenied(CaptureSource),

    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Signaling connection error: {0}")]
    ConnectionError(String),

    #[error("A peer link already exists for participant {0}")]
    DuplicateLink(ParticipantId),

    #[error("Negotiation with {participant} failed: {reason}")]
    NegotiationFailed {
        participant: ParticipantId,
        reason: String,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Operation cancelled by disconnect")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the error is meant to be shown to the user as-is.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Error::PermissionDenied(_) | Error::DeviceUnavailable(_) | Error::ConnectionError(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_id_display() {
        let id = ParticipantId::from("u2");
        assert_eq!(format!("{}", id), "u2");
        assert_eq!(id.as_str(), "u2");
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(ParticipantId::random(), ParticipantId::random());
    }

    #[test]
    fn link_state_transitions() {
        assert!(LinkState::Negotiating.can_transition_to(LinkState::Connected));
        assert!(LinkState::Negotiating.can_transition_to(LinkState::Closed));
        assert!(LinkState::Connected.can_transition_to(LinkState::Closed));
        assert!(!LinkState::Closed.can_transition_to(LinkState::Connected));
        assert!(!LinkState::Closed.can_transition_to(LinkState::Negotiating));
        assert!(!LinkState::Connected.can_transition_to(LinkState::Negotiating));
    }

    #[test]
    fn error_display() {
        let denied = Error::PermissionDenied(CaptureSource::Microphone);
        assert!(format!("{}", denied).contains("microphone"));

        let dup = Error::DuplicateLink(ParticipantId::from("u3"));
        assert!(format!("{}", dup).contains("u3"));

        let anyhow_err = Error::Other(anyhow::anyhow!("Something went wrong"));
        assert!(format!("{}", anyhow_err).contains("Something went wrong"));
    }

    #[test]
    fn user_visible_errors() {
        assert!(Error::PermissionDenied(CaptureSource::Screen).is_user_visible());
        assert!(Error::ConnectionError("refused".into()).is_user_visible());
        assert!(!Error::DuplicateLink(ParticipantId::from("x")).is_user_visible());
        assert!(!Error::Cancelled.is_user_visible());
    }
}
