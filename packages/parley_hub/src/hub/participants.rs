//! Participant roster.
//!
//! Owned exclusively by a conversation's actor; tracks identity, kind
//! and online status. A participant who disconnects stays listed but
//! offline, so history attribution and rejoin keep working.

use chrono::Utc;
use std::collections::HashMap;

use crate::error::HubError;
use parley_protocol::{
    ConnectionState, ConversationMode, ParticipantId, ParticipantInfo, ParticipantKind,
};

pub struct Roster {
    participants: HashMap<ParticipantId, ParticipantInfo>,
    max_participants: usize,
}

impl Roster {
    pub fn new(max_participants: usize) -> Self {
        Self {
            participants: HashMap::new(),
            max_participants,
        }
    }

    /// Add a participant, or mark an existing one online again.
    pub fn join(
        &mut self,
        id: ParticipantId,
        kind: ParticipantKind,
        display_name: String,
    ) -> Result<&ParticipantInfo, HubError> {
        let now = Utc::now();
        if let Some(existing) = self.participants.get_mut(&id) {
            existing.connection_state = ConnectionState::Open;
            existing.last_seen = now;
            existing.display_name = display_name;
            return Ok(&self.participants[&id]);
        }

        if self.participants.len() >= self.max_participants {
            return Err(HubError::ConversationFull {
                limit: self.max_participants,
            });
        }

        self.participants.insert(
            id.clone(),
            ParticipantInfo {
                id: id.clone(),
                kind,
                display_name,
                connection_state: ConnectionState::Open,
                joined_at: now,
                last_seen: now,
            },
        );
        Ok(&self.participants[&id])
    }

    /// Mark a participant offline. They remain listed.
    pub fn mark_offline(&mut self, id: &ParticipantId) {
        if let Some(p) = self.participants.get_mut(id) {
            p.connection_state = ConnectionState::Closed;
            p.last_seen = Utc::now();
        }
    }

    pub fn set_state(&mut self, id: &ParticipantId, state: ConnectionState) {
        if let Some(p) = self.participants.get_mut(id) {
            p.connection_state = state;
            p.last_seen = Utc::now();
        }
    }

    pub fn touch(&mut self, id: &ParticipantId) {
        if let Some(p) = self.participants.get_mut(id) {
            p.last_seen = Utc::now();
        }
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&ParticipantInfo> {
        self.participants.get(id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.contains_key(id)
    }

    /// Roster snapshot, stable order (join time, then id for ties).
    pub fn list(&self) -> Vec<ParticipantInfo> {
        let mut all: Vec<ParticipantInfo> = self.participants.values().cloned().collect();
        all.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        all
    }

    pub fn online_count(&self, kind: ParticipantKind) -> usize {
        self.participants
            .values()
            .filter(|p| p.kind == kind && p.is_online())
            .count()
    }

    /// Mode is derived from liveness: single when exactly one human
    /// and at most one agent are online, multi otherwise.
    pub fn mode(&self) -> ConversationMode {
        let humans = self.online_count(ParticipantKind::Human);
        let agents = self.online_count(ParticipantKind::Agent);
        if humans == 1 && agents <= 1 {
            ConversationMode::Single
        } else {
            ConversationMode::Multi
        }
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> Roster {
        Roster::new(10)
    }

    #[test]
    fn join_and_mode_transitions() {
        let mut r = roster();
        r.join(
            ParticipantId::new("alice"),
            ParticipantKind::Human,
            "Alice".into(),
        )
        .unwrap();
        r.join(ParticipantId::new("bot"), ParticipantKind::Agent, "Bot".into())
            .unwrap();
        assert_eq!(r.mode(), ConversationMode::Single);

        r.join(ParticipantId::new("bob"), ParticipantKind::Human, "Bob".into())
            .unwrap();
        assert_eq!(r.mode(), ConversationMode::Multi);

        // Bob leaves: back to single
        r.mark_offline(&ParticipantId::new("bob"));
        assert_eq!(r.mode(), ConversationMode::Single);
    }

    #[test]
    fn two_agents_make_multi() {
        let mut r = roster();
        r.join(
            ParticipantId::new("alice"),
            ParticipantKind::Human,
            "Alice".into(),
        )
        .unwrap();
        r.join(ParticipantId::new("b1"), ParticipantKind::Agent, "B1".into())
            .unwrap();
        r.join(ParticipantId::new("b2"), ParticipantKind::Agent, "B2".into())
            .unwrap();
        assert_eq!(r.mode(), ConversationMode::Multi);
    }

    #[test]
    fn offline_participant_stays_listed() {
        let mut r = roster();
        r.join(
            ParticipantId::new("alice"),
            ParticipantKind::Human,
            "Alice".into(),
        )
        .unwrap();
        r.mark_offline(&ParticipantId::new("alice"));

        let list = r.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].connection_state, ConnectionState::Closed);
        assert!(!list[0].is_online());
    }

    #[test]
    fn rejoin_marks_online_without_duplicate() {
        let mut r = roster();
        let alice = ParticipantId::new("alice");
        r.join(alice.clone(), ParticipantKind::Human, "Alice".into())
            .unwrap();
        r.mark_offline(&alice);
        r.join(alice.clone(), ParticipantKind::Human, "Alice".into())
            .unwrap();

        assert_eq!(r.len(), 1);
        assert!(r.get(&alice).unwrap().is_online());
    }

    #[test]
    fn capacity_enforced() {
        let mut r = Roster::new(1);
        r.join(ParticipantId::new("a"), ParticipantKind::Human, "A".into())
            .unwrap();
        let err = r
            .join(ParticipantId::new("b"), ParticipantKind::Human, "B".into())
            .unwrap_err();
        assert!(matches!(err, HubError::ConversationFull { limit: 1 }));
    }
}
