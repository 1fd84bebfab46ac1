use async_trait::async_trait;
use tokio::sync::mpsc;
use voice_core::{
    ChannelId, Error, LocalIdentity, ParticipantId, ParticipantPatch, SignalPayload,
    SignalingEvent,
};

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

/// An open, session-scoped connection to the relay.
///
/// The inbound half is the `events` receiver handed out by
/// [`SignalingChannel::open`]; it ends once the link is closed or the relay goes away.
pub struct OpenChannel {
    pub link: Box<dyn SignalingLink>,
    pub events: mpsc::UnboundedReceiver<SignalingEvent>,
}

impl std::fmt::Debug for OpenChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenChannel")
            .field("local_id", self.link.local_id())
            .finish()
    }
}

/// Factory for relay connections.
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Join `channel` as `identity`. The first event delivered is always a
    /// `RosterSnapshot` of the participants already present.
    async fn open(&self, channel: &ChannelId, identity: &LocalIdentity)
        -> Result<OpenChannel, Error>;
}

/// Outbound half of an open relay connection.
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait SignalingLink: Send + Sync {
    /// Identifier the relay knows us by.
    fn local_id(&self) -> &ParticipantId;

    /// Best-effort delivery of a negotiation payload to one participant.
    fn send_signal(&self, to: &ParticipantId, payload: SignalPayload) -> Result<(), Error>;

    /// Announce a change of local state to every other participant.
    fn broadcast_update(&self, patch: &ParticipantPatch) -> Result<(), Error>;

    /// Leave the channel. No new events are produced once this returns.
    async fn close(&self);
}
