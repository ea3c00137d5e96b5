//! WebSocket frame types.
//!
//! Closed enums for client-server communication, tagged by a `type`
//! field. Adding a frame kind is a compile-time-checked change; there
//! is no stringly-typed dispatch anywhere in the hub.

use serde::{Deserialize, Serialize};

use crate::model::{ConversationMode, Message, ParticipantId, ParticipantInfo};

/// Machine-readable error codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    QueueFull,
    AuthFailed,
    RateLimited,
}

/// Messages sent FROM the client TO the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Submit a message to the conversation.
    Message {
        content: String,
        /// Client-generated id; resending with the same id is
        /// idempotent (at-least-once retry support).
        client_message_id: String,
    },
    /// Typing indicator. Relayed to other participants, never
    /// sequenced or queued.
    Typing { is_typing: bool },
    /// Reconnection sync: replay everything after `last_sequence_id`.
    Sync { last_sequence_id: u64 },
}

/// Messages sent FROM the hub TO clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A sequenced conversation message.
    Message { message: Message },
    /// First frame after a successful join: the roster plus the
    /// conversation's current sequence id. A client holding history
    /// older than `last_sequence_id` follows up with `sync` to close
    /// the gap.
    Welcome {
        participants: Vec<ParticipantInfo>,
        mode: ConversationMode,
        last_sequence_id: u64,
    },
    /// Roster or mode changed.
    ParticipantUpdate {
        participants: Vec<ParticipantInfo>,
        mode: ConversationMode,
    },
    /// Another participant's typing state.
    Typing {
        participant: ParticipantId,
        is_typing: bool,
    },
    /// Reply to a `sync` request: the missed messages in ascending
    /// sequence order plus the current roster.
    Sync {
        messages: Vec<Message>,
        current_sequence_id: u64,
        participants: Vec<ParticipantInfo>,
        /// True when the replayed range could not be fully covered
        /// (history unavailable); the client should not assume it has
        /// a gapless view below `current_sequence_id`.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        sync_incomplete: bool,
    },
    /// Submission acknowledgement: the sequence id assigned to the
    /// client's `client_message_id` (also returned for duplicates).
    Ack {
        client_message_id: String,
        sequence_id: u64,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConversationId, MessageStatus, ParticipantKind};
    use chrono::Utc;

    fn sample_message(seq: u64) -> Message {
        Message {
            sequence_id: seq,
            conversation_id: ConversationId::new("c1"),
            sender_id: ParticipantId::new("alice"),
            sender_kind: ParticipantKind::Human,
            content: "hi".to_string(),
            client_message_id: "cm-1".to_string(),
            created_at: Utc::now(),
            status: MessageStatus::Delivered,
        }
    }

    #[test]
    fn client_frame_uses_type_tag() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"message","content":"hello","client_message_id":"abc"}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::Message {
                content,
                client_message_id,
            } => {
                assert_eq!(content, "hello");
                assert_eq!(client_message_id, "abc");
            }
            other => panic!("Expected Message, got {:?}", other),
        }
    }

    #[test]
    fn sync_request_parses() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"sync","last_sequence_id":42}"#).unwrap();
        match frame {
            ClientFrame::Sync { last_sequence_id } => assert_eq!(last_sequence_id, 42),
            other => panic!("Expected Sync, got {:?}", other),
        }
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let res = serde_json::from_str::<ClientFrame>(r#"{"type":"eval","code":"rm -rf"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn error_codes_are_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::QueueFull).unwrap();
        assert_eq!(json, "\"QUEUE_FULL\"");
        let json = serde_json::to_string(&ErrorCode::AuthFailed).unwrap();
        assert_eq!(json, "\"AUTH_FAILED\"");
    }

    #[test]
    fn sync_incomplete_omitted_when_false() {
        let frame = ServerFrame::Sync {
            messages: vec![sample_message(1)],
            current_sequence_id: 1,
            participants: Vec::new(),
            sync_incomplete: false,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("sync_incomplete"));

        let frame = ServerFrame::Sync {
            messages: Vec::new(),
            current_sequence_id: 5,
            participants: Vec::new(),
            sync_incomplete: true,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"sync_incomplete\":true"));
    }

    #[test]
    fn welcome_carries_resume_point() {
        let frame = ServerFrame::Welcome {
            participants: Vec::new(),
            mode: ConversationMode::Single,
            last_sequence_id: 9,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"welcome\""));
        assert!(json.contains("\"last_sequence_id\":9"));
    }

    #[test]
    fn server_message_frame_embeds_message() {
        let frame = ServerFrame::Message {
            message: sample_message(7),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"message\""));
        assert!(json.contains("\"sequence_id\":7"));
    }
}
