//! Conversation model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a conversation.
///
/// Newtyped so registry keys can never be confused with participant
/// ids or raw payload strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a participant (human or agent), assigned by the
/// identity layer upstream of the hub.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantKind {
    Human,
    Agent,
    /// Hub-generated notices (join/leave). Never a live participant.
    System,
}

/// Delivery/persistence status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Persisted,
    Failed,
}

/// A single conversation message.
///
/// Immutable once a `sequence_id` has been assigned; the hub only
/// flips `status` on its own copy for persistence bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned, gapless, strictly increasing within a
    /// conversation. Establishes the total order every participant
    /// observes.
    pub sequence_id: u64,
    pub conversation_id: ConversationId,
    pub sender_id: ParticipantId,
    pub sender_kind: ParticipantKind,
    pub content: String,
    /// Client-generated id used to de-duplicate at-least-once retries.
    pub client_message_id: String,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
}

/// Transport state of a participant's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Syncing,
    Closed,
}

/// Conversation mode, derived from the number of live humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationMode {
    /// Exactly one human and at most one agent online.
    Single,
    Multi,
}

/// Roster entry for one participant of a conversation.
///
/// A participant with no live connection stays listed but is marked
/// offline (`connection_state = Closed`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    pub kind: ParticipantKind,
    pub display_name: String,
    pub connection_state: ConnectionState,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ParticipantInfo {
    pub fn is_online(&self) -> bool {
        matches!(
            self.connection_state,
            ConnectionState::Open | ConnectionState::Syncing
        )
    }
}
