//! Authorization hook.
//!
//! Identity resolution lives outside the hub; the handshake carries an
//! opaque token that a deployment-provided hook may verify. The
//! default accepts everything, which keeps local development and tests
//! friction-free.

use parley_protocol::{ConversationId, ParticipantId};

pub trait AuthHook: Send + Sync {
    /// Decide whether this participant may attach to the conversation.
    fn authorize(
        &self,
        conversation_id: &ConversationId,
        participant_id: &ParticipantId,
        token: Option<&str>,
    ) -> bool;
}

/// Accepts every handshake.
pub struct PermissiveAuth;

impl AuthHook for PermissiveAuth {
    fn authorize(&self, _: &ConversationId, _: &ParticipantId, _: Option<&str>) -> bool {
        true
    }
}

/// Requires the handshake token to match a shared secret.
pub struct SharedSecretAuth {
    secret: String,
}

impl SharedSecretAuth {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl AuthHook for SharedSecretAuth {
    fn authorize(
        &self,
        _conversation_id: &ConversationId,
        _participant_id: &ParticipantId,
        token: Option<&str>,
    ) -> bool {
        token == Some(self.secret.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissive_accepts_anything() {
        let auth = PermissiveAuth;
        assert!(auth.authorize(
            &ConversationId::new("c"),
            &ParticipantId::new("p"),
            None
        ));
    }

    #[test]
    fn shared_secret_requires_exact_token() {
        let auth = SharedSecretAuth::new("hunter2");
        let convo = ConversationId::new("c");
        let p = ParticipantId::new("p");
        assert!(auth.authorize(&convo, &p, Some("hunter2")));
        assert!(!auth.authorize(&convo, &p, Some("wrong")));
        assert!(!auth.authorize(&convo, &p, None));
    }
}
