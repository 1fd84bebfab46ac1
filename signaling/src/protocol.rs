//! Wire format spoken between clients and the relay.
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<name>", "data": <payload>}`.

use serde::{Deserialize, Serialize};
use voice_core::{ParticipantId, ParticipantPatch, PeerInfo, SignalPayload, SignalingEvent};

/// Messages a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Join {
        channel_id: String,
        user_id: ParticipantId,
        username: String,
    },
    #[serde(rename_all = "camelCase")]
    Signal {
        user_id: ParticipantId,
        signal: SignalPayload,
    },
    UserUpdate(ParticipantPatch),
    Leave,
}

/// Messages the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    UserList(Vec<PeerInfo>),
    UserJoined(PeerInfo),
    UserLeft { id: ParticipantId },
    #[serde(rename_all = "camelCase")]
    Signal {
        user_id: ParticipantId,
        signal: SignalPayload,
    },
    #[serde(rename_all = "camelCase")]
    UserUpdated {
        user_id: ParticipantId,
        updates: ParticipantPatch,
    },
    Error { message: String },
}

impl ServerMessage {
    /// Translate into the session-facing event, if the message carries one.
    pub fn into_event(self) -> Option<SignalingEvent> {
        match self {
            ServerMessage::UserList(participants) => {
                Some(SignalingEvent::RosterSnapshot { participants })
            }
            ServerMessage::UserJoined(info) => Some(SignalingEvent::ParticipantJoined {
                id: info.id,
                username: info.username,
            }),
            ServerMessage::UserLeft { id } => Some(SignalingEvent::ParticipantLeft { id }),
            ServerMessage::Signal { user_id, signal } => Some(SignalingEvent::Signal {
                from: user_id,
                payload: signal,
            }),
            ServerMessage::UserUpdated { user_id, updates } => {
                Some(SignalingEvent::ParticipantUpdated {
                    id: user_id,
                    patch: updates,
                })
            }
            ServerMessage::Error { .. } => None,
        }
    }
}
