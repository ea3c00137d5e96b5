//! Hub error taxonomy.
//!
//! Only `QueueFull`, `AuthFailed` and `RateLimited` are ever surfaced
//! to clients; everything else is recovered locally and logged so one
//! participant's failure never halts the conversation for others.

use parley_protocol::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    /// Admission rejected: the conversation's in-flight bound is
    /// reached and nothing lower-priority remains to evict.
    #[error("conversation queue is full, retry after {retry_after_secs}s")]
    QueueFull { retry_after_secs: u64 },

    /// Handshake carried no usable identity, or the auth hook
    /// rejected it.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rate limited")]
    RateLimited,

    /// The conversation already holds `max_participants` members.
    #[error("conversation is full ({limit} participants)")]
    ConversationFull { limit: usize },

    /// An agent responder exceeded its per-turn timeout. Its
    /// contribution is dropped for this turn, never retried.
    #[error("agent '{agent}' timed out after {timeout_secs}s")]
    AgentTimeout { agent: String, timeout_secs: u64 },

    /// Best-effort storage write failed after retries.
    #[error("storage write failed: {0}")]
    StorageWrite(String),

    #[error("history load failed: {0}")]
    StorageLoad(String),

    /// The peer's transport went away. Registry entry is removed; no
    /// message loss, resync covers the gap.
    #[error("connection lost")]
    ConnectionLost,

    /// The conversation actor's mailbox is gone (conversation was
    /// evicted or the hub is shutting down).
    #[error("conversation is no longer active")]
    ConversationClosed,
}

impl HubError {
    /// The wire code for errors that are surfaced to clients.
    pub fn wire_code(&self) -> Option<ErrorCode> {
        match self {
            HubError::QueueFull { .. } => Some(ErrorCode::QueueFull),
            HubError::AuthFailed(_) => Some(ErrorCode::AuthFailed),
            HubError::RateLimited => Some(ErrorCode::RateLimited),
            _ => None,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            HubError::QueueFull { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_client_facing_errors_have_wire_codes() {
        assert_eq!(
            HubError::QueueFull {
                retry_after_secs: 1
            }
            .wire_code(),
            Some(ErrorCode::QueueFull)
        );
        assert_eq!(
            HubError::AuthFailed("no token".into()).wire_code(),
            Some(ErrorCode::AuthFailed)
        );
        assert!(
            HubError::AgentTimeout {
                agent: "bot".into(),
                timeout_secs: 20
            }
            .wire_code()
            .is_none()
        );
        assert!(HubError::StorageWrite("disk".into()).wire_code().is_none());
    }
}
