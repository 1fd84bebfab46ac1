//! Relay hub: channel membership and message fan-out.
//!
//! The hub is transport agnostic. The WebSocket server and the in-process
//! [`LocalSignaling`](crate::local::LocalSignaling) both drive it.

use crate::protocol::ServerMessage;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use voice_core::{ChannelId, Error, ParticipantId, ParticipantPatch, PeerInfo, SignalPayload};

struct Member {
    username: String,
    /// Every patch the member announced, folded together
    state: ParticipantPatch,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl Member {
    fn info(&self, id: &ParticipantId) -> PeerInfo {
        PeerInfo::new(id.clone(), self.username.clone()).with_state(self.state.clone())
    }
}

#[derive(Default)]
struct RelayState {
    /// Members keyed by join order within each channel
    channels: HashMap<ChannelId, BTreeMap<u64, (ParticipantId, Member)>>,
    next_seq: u64,
}

impl RelayState {
    fn channel(&self, channel: &ChannelId) -> impl Iterator<Item = &(ParticipantId, Member)> {
        self.channels.get(channel).into_iter().flat_map(|m| m.values())
    }

    fn find(&self, channel: &ChannelId, id: &ParticipantId) -> Option<&Member> {
        self.channel(channel)
            .find(|(member_id, _)| member_id == id)
            .map(|(_, member)| member)
    }

    /// Send to every member of `channel` except `except`.
    fn fan_out(&self, channel: &ChannelId, except: &ParticipantId, message: &ServerMessage) {
        for (id, member) in self.channel(channel) {
            if id != except {
                let _ = member.tx.send(message.clone());
            }
        }
    }
}

/// Shared, cloneable relay hub.
#[derive(Clone, Default)]
pub struct Relay {
    state: Arc<Mutex<RelayState>>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        // A poisoned hub only means a sender panicked mid fan-out; the maps are still valid.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a member to a channel.
    ///
    /// The newcomer receives the `user-list` of members already present, each
    /// with the state it last announced, and every existing member receives
    /// `user-joined`.
    pub fn join(
        &self,
        channel: &ChannelId,
        id: &ParticipantId,
        username: &str,
    ) -> Result<mpsc::UnboundedReceiver<ServerMessage>, Error> {
        let mut state = self.lock();
        if state.find(channel, id).is_some() {
            return Err(Error::ConnectionError(format!(
                "participant {} is already in channel {}",
                id, channel
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let present: Vec<PeerInfo> = state.channel(channel).map(|(id, m)| m.info(id)).collect();
        let _ = tx.send(ServerMessage::UserList(present));

        state.fan_out(
            channel,
            id,
            &ServerMessage::UserJoined(PeerInfo::new(id.clone(), username)),
        );

        let seq = state.next_seq;
        state.next_seq += 1;
        state.channels.entry(channel.clone()).or_default().insert(
            seq,
            (
                id.clone(),
                Member {
                    username: username.to_string(),
                    state: ParticipantPatch::default(),
                    tx,
                },
            ),
        );
        info!("{} ({}) joined channel {}", username, id, channel);
        Ok(rx)
    }

    /// Remove a member and tell the rest of the channel. No-op if absent.
    pub fn leave(&self, channel: &ChannelId, id: &ParticipantId) {
        let mut state = self.lock();
        let Some(members) = state.channels.get_mut(channel) else {
            return;
        };
        let Some(seq) = members
            .iter()
            .find(|(_, (member_id, _))| member_id == id)
            .map(|(seq, _)| *seq)
        else {
            return;
        };
        members.remove(&seq);
        if members.is_empty() {
            state.channels.remove(channel);
        }
        state.fan_out(channel, id, &ServerMessage::UserLeft { id: id.clone() });
        info!("{} left channel {}", id, channel);
    }

    /// Forward a negotiation payload from `from` to `to`.
    pub fn signal(
        &self,
        channel: &ChannelId,
        from: &ParticipantId,
        to: &ParticipantId,
        signal: SignalPayload,
    ) {
        let state = self.lock();
        match state.find(channel, to) {
            Some(member) => {
                debug!("Relaying signal {} -> {}", from, to);
                let _ = member.tx.send(ServerMessage::Signal {
                    user_id: from.clone(),
                    signal,
                });
            }
            None => warn!("Dropping signal from {} to unknown participant {}", from, to),
        }
    }

    /// Broadcast a state patch from `from` to the rest of the channel and
    /// remember it for members who join later.
    pub fn update(&self, channel: &ChannelId, from: &ParticipantId, patch: ParticipantPatch) {
        if patch.is_empty() {
            return;
        }
        let mut state = self.lock();
        let Some(member) = state
            .channels
            .get_mut(channel)
            .and_then(|members| members.values_mut().find(|(id, _)| id == from))
        else {
            warn!("Dropping update from {} outside channel {}", from, channel);
            return;
        };
        member.1.state.merge(&patch);
        state.fan_out(
            channel,
            from,
            &ServerMessage::UserUpdated {
                user_id: from.clone(),
                updates: patch,
            },
        );
    }

    /// Members of a channel in join order.
    pub fn members(&self, channel: &ChannelId) -> Vec<PeerInfo> {
        self.lock()
            .channel(channel)
            .map(|(id, m)| m.info(id))
            .collect()
    }
}
