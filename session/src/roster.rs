use log::debug;
use std::collections::BTreeMap;
use voice_core::{LinkState, Participant, ParticipantId, ParticipantPatch};

/// Remote participants of the active session, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ParticipantRoster {
    participants: BTreeMap<ParticipantId, Participant>,
}

impl ParticipantRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a participant, replacing any entry with the same id.
    pub fn upsert(&mut self, participant: Participant) {
        self.participants.insert(participant.id.clone(), participant);
    }

    /// Apply a patch. Patches for unknown ids are dropped.
    pub fn apply_patch(&mut self, id: &ParticipantId, patch: &ParticipantPatch) -> bool {
        match self.participants.get_mut(id) {
            Some(participant) => {
                participant.apply(patch);
                true
            }
            None => {
                debug!("Dropping update for unknown participant {}", id);
                false
            }
        }
    }

    pub fn set_link_state(&mut self, id: &ParticipantId, state: LinkState) {
        if let Some(participant) = self.participants.get_mut(id) {
            participant.link_state = state;
        }
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<Participant> {
        self.participants.remove(id)
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Copy of every participant, ordered by id.
    pub fn snapshot(&self) -> Vec<Participant> {
        self.participants.values().cloned().collect()
    }
}
