//! Responder collaborator interface.
//!
//! Wraps the external AI pipeline behind a narrow trait the hub
//! depends on. The concrete adapter lives outside the core and is
//! injected at registration time; tests use scripted responders.

use async_trait::async_trait;
use std::sync::Arc;

use parley_protocol::{ConversationId, Message, ParticipantId};

/// An AI participant that may contribute a reply to a conversation
/// turn.
///
/// `respond` is awaited under the per-agent timeout and must be
/// cancel-safe: the hub drops the future on timeout or when the
/// agent's pending turn is evicted under queue pressure.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Decide whether to reply to the latest message. The context
    /// window holds the trailing messages of the conversation in
    /// sequence order, newest last.
    async fn respond(
        &self,
        conversation_id: &ConversationId,
        context: &[Message],
    ) -> Option<String>;
}

/// A registered agent: its participant identity plus the injected
/// pipeline adapter.
#[derive(Clone)]
pub struct AgentRegistration {
    pub id: ParticipantId,
    pub display_name: String,
    pub responder: Arc<dyn Responder>,
}

impl AgentRegistration {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        responder: Arc<dyn Responder>,
    ) -> Self {
        Self {
            id: ParticipantId::new(id),
            display_name: display_name.into(),
            responder,
        }
    }
}

pub mod testing {
    //! Responder doubles used across the hub's tests.

    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replies with a fixed line to every human message.
    pub struct EchoResponder {
        pub prefix: String,
    }

    #[async_trait]
    impl Responder for EchoResponder {
        async fn respond(
            &self,
            _conversation_id: &ConversationId,
            context: &[Message],
        ) -> Option<String> {
            let last = context.last()?;
            Some(format!("{}{}", self.prefix, last.content))
        }
    }

    /// Never finishes within any reasonable timeout.
    pub struct StalledResponder;

    #[async_trait]
    impl Responder for StalledResponder {
        async fn respond(
            &self,
            _conversation_id: &ConversationId,
            _context: &[Message],
        ) -> Option<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            None
        }
    }

    /// Pops pre-scripted replies in order; None once exhausted.
    pub struct ScriptedResponder {
        replies: Mutex<Vec<String>>,
    }

    impl ScriptedResponder {
        pub fn new(replies: Vec<String>) -> Self {
            Self {
                replies: Mutex::new(replies),
            }
        }
    }

    #[async_trait]
    impl Responder for ScriptedResponder {
        async fn respond(
            &self,
            _conversation_id: &ConversationId,
            _context: &[Message],
        ) -> Option<String> {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                None
            } else {
                Some(replies.remove(0))
            }
        }
    }
}
