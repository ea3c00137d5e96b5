//! Connection registry.
//!
//! Tracks live WebSocket connections keyed by
//! `(ConversationId, ParticipantId)`, with no business logic of its
//! own. A participant holds at most one live connection: registering
//! a new one supersedes and closes the old (most-recent-wins).
//!
//! Broadcast walks only the target conversation's connections and
//! never blocks on a slow peer: each connection has a bounded outbound
//! buffer and `try_send` overflow closes that connection, not the
//! broadcast.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metrics::HubMetrics;
use parley_protocol::{ConnectionState, ConversationId, ParticipantId, ServerFrame};

/// One live connection's registry entry.
struct Connection {
    connection_id: Uuid,
    sender: mpsc::Sender<ServerFrame>,
    /// Cancelling tears down the owning socket tasks.
    cancel: CancellationToken,
    state: ConnectionState,
    last_seen: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<(ConversationId, ParticipantId), Connection>,
}

pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
    metrics: Arc<HubMetrics>,
}

impl ConnectionRegistry {
    pub fn new(metrics: Arc<HubMetrics>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            metrics,
        }
    }

    /// Register a connection, superseding any existing one for the
    /// same participant. Returns this connection's id.
    pub async fn register(
        &self,
        conversation_id: ConversationId,
        participant_id: ParticipantId,
        sender: mpsc::Sender<ServerFrame>,
        cancel: CancellationToken,
    ) -> Uuid {
        let connection_id = Uuid::new_v4();
        let key = (conversation_id, participant_id);

        let mut inner = self.inner.write().await;
        if let Some(old) = inner.connections.remove(&key) {
            debug!(
                conversation = %key.0,
                participant = %key.1,
                "Superseding existing connection"
            );
            old.cancel.cancel();
            self.metrics.connection_superseded();
        }
        inner.connections.insert(
            key,
            Connection {
                connection_id,
                sender,
                cancel,
                state: ConnectionState::Connecting,
                last_seen: Utc::now(),
            },
        );
        connection_id
    }

    /// Remove a connection. `connection_id` guards against a stale
    /// socket task unregistering the connection that superseded it.
    pub async fn unregister(
        &self,
        conversation_id: &ConversationId,
        participant_id: &ParticipantId,
        connection_id: Uuid,
    ) -> bool {
        let key = (conversation_id.clone(), participant_id.clone());
        let mut inner = self.inner.write().await;
        match inner.connections.get(&key) {
            Some(conn) if conn.connection_id == connection_id => {
                if let Some(conn) = inner.connections.remove(&key) {
                    conn.cancel.cancel();
                }
                true
            }
            _ => false,
        }
    }

    /// Deliver a frame to every live connection of a conversation.
    /// Slow or broken connections are closed, never waited on.
    /// Returns the participants that received the frame.
    pub async fn broadcast(
        &self,
        conversation_id: &ConversationId,
        frame: &ServerFrame,
    ) -> Vec<ParticipantId> {
        let mut delivered = Vec::new();
        let mut broken = Vec::new();

        {
            let inner = self.inner.read().await;
            for ((convo, participant), conn) in &inner.connections {
                if convo != conversation_id {
                    continue;
                }
                // Only fully open connections receive live frames.
                // Connecting peers have not joined yet; Syncing peers
                // get the range in their sync reply instead, which
                // keeps delivery exactly-once and in order.
                if conn.state != ConnectionState::Open {
                    continue;
                }
                match conn.sender.try_send(frame.clone()) {
                    Ok(()) => delivered.push(participant.clone()),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            conversation = %conversation_id,
                            participant = %participant,
                            "Send buffer overflow, closing connection"
                        );
                        self.metrics.frame_dropped();
                        broken.push(participant.clone());
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        broken.push(participant.clone());
                    }
                }
            }
        }

        for participant in &broken {
            self.close(conversation_id, participant).await;
        }
        delivered
    }

    /// Deliver a frame to one participant only (acks, errors, sync
    /// replies). Overflow closes the connection, same as broadcast.
    pub async fn send_to(
        &self,
        conversation_id: &ConversationId,
        participant_id: &ParticipantId,
        frame: ServerFrame,
    ) -> bool {
        let key = (conversation_id.clone(), participant_id.clone());
        let result = {
            let inner = self.inner.read().await;
            match inner.connections.get(&key) {
                Some(conn) => conn.sender.try_send(frame).map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => true,
                    mpsc::error::TrySendError::Closed(_) => false,
                }),
                None => return false,
            }
        };
        match result {
            Ok(()) => true,
            Err(overflow) => {
                if overflow {
                    self.metrics.frame_dropped();
                }
                self.close(conversation_id, participant_id).await;
                false
            }
        }
    }

    /// Force-close and remove a connection.
    pub async fn close(&self, conversation_id: &ConversationId, participant_id: &ParticipantId) {
        let key = (conversation_id.clone(), participant_id.clone());
        let mut inner = self.inner.write().await;
        if let Some(conn) = inner.connections.remove(&key) {
            conn.cancel.cancel();
        }
    }

    /// Record traffic from a connection (message, typing, pong).
    pub async fn mark_seen(&self, conversation_id: &ConversationId, participant_id: &ParticipantId) {
        let key = (conversation_id.clone(), participant_id.clone());
        let mut inner = self.inner.write().await;
        if let Some(conn) = inner.connections.get_mut(&key) {
            conn.last_seen = Utc::now();
        }
    }

    /// Advance a connection's state machine. `Closed` is terminal: a
    /// closed entry never transitions again (a fresh connection starts
    /// a fresh entry via `register`).
    pub async fn set_state(
        &self,
        conversation_id: &ConversationId,
        participant_id: &ParticipantId,
        state: ConnectionState,
    ) {
        let key = (conversation_id.clone(), participant_id.clone());
        let mut inner = self.inner.write().await;
        if let Some(conn) = inner.connections.get_mut(&key) {
            if conn.state != ConnectionState::Closed {
                conn.state = state;
            }
        }
    }

    pub async fn state_of(
        &self,
        conversation_id: &ConversationId,
        participant_id: &ParticipantId,
    ) -> Option<ConnectionState> {
        let key = (conversation_id.clone(), participant_id.clone());
        let inner = self.inner.read().await;
        inner.connections.get(&key).map(|c| c.state)
    }

    /// Participants of a conversation with a live connection.
    pub async fn live_participants(&self, conversation_id: &ConversationId) -> Vec<ParticipantId> {
        let inner = self.inner.read().await;
        inner
            .connections
            .keys()
            .filter(|(convo, _)| convo == conversation_id)
            .map(|(_, participant)| participant.clone())
            .collect()
    }

    /// Close and remove every connection silent for longer than
    /// `timeout`. Returns the affected `(conversation, participant)`
    /// pairs so the orchestrator can mark them offline.
    pub async fn sweep_dead(&self, timeout: Duration) -> Vec<(ConversationId, ParticipantId)> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::minutes(10));

        let mut inner = self.inner.write().await;
        let dead: Vec<(ConversationId, ParticipantId)> = inner
            .connections
            .iter()
            .filter(|(_, conn)| conn.last_seen < cutoff)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &dead {
            if let Some(conn) = inner.connections.remove(key) {
                warn!(
                    conversation = %key.0,
                    participant = %key.1,
                    "Closing dead connection (no traffic since {})",
                    conn.last_seen
                );
                conn.cancel.cancel();
                self.metrics.connection_reaped();
            }
        }
        dead
    }

    /// Drop all connections of an evicted conversation.
    pub async fn remove_conversation(&self, conversation_id: &ConversationId) {
        let mut inner = self.inner.write().await;
        let keys: Vec<_> = inner
            .connections
            .keys()
            .filter(|(convo, _)| convo == conversation_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(conn) = inner.connections.remove(&key) {
                conn.cancel.cancel();
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(HubMetrics::new()))
    }

    fn channel(buffer: usize) -> (mpsc::Sender<ServerFrame>, mpsc::Receiver<ServerFrame>) {
        mpsc::channel(buffer)
    }

    fn typing_frame(who: &str) -> ServerFrame {
        ServerFrame::Typing {
            participant: ParticipantId::new(who),
            is_typing: true,
        }
    }

    #[tokio::test]
    async fn register_and_broadcast() {
        let reg = registry();
        let convo = ConversationId::new("c1");
        let (tx_a, mut rx_a) = channel(8);
        let (tx_b, mut rx_b) = channel(8);
        let cancel_a = CancellationToken::new();
        let cancel_b = CancellationToken::new();

        reg.register(convo.clone(), ParticipantId::new("a"), tx_a, cancel_a)
            .await;
        reg.register(convo.clone(), ParticipantId::new("b"), tx_b, cancel_b)
            .await;
        reg.set_state(&convo, &ParticipantId::new("a"), ConnectionState::Open)
            .await;
        reg.set_state(&convo, &ParticipantId::new("b"), ConnectionState::Open)
            .await;

        let delivered = reg.broadcast(&convo, &typing_frame("a")).await;
        assert_eq!(delivered.len(), 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn broadcast_scoped_to_conversation() {
        let reg = registry();
        let (tx_a, mut rx_a) = channel(8);
        let (tx_b, mut rx_b) = channel(8);

        reg.register(
            ConversationId::new("c1"),
            ParticipantId::new("a"),
            tx_a,
            CancellationToken::new(),
        )
        .await;
        reg.register(
            ConversationId::new("c2"),
            ParticipantId::new("b"),
            tx_b,
            CancellationToken::new(),
        )
        .await;
        reg.set_state(
            &ConversationId::new("c1"),
            &ParticipantId::new("a"),
            ConnectionState::Open,
        )
        .await;
        reg.set_state(
            &ConversationId::new("c2"),
            &ParticipantId::new("b"),
            ConnectionState::Open,
        )
        .await;

        reg.broadcast(&ConversationId::new("c1"), &typing_frame("a"))
            .await;
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn new_connection_supersedes_old() {
        let reg = registry();
        let convo = ConversationId::new("c1");
        let alice = ParticipantId::new("alice");
        let (tx_old, _rx_old) = channel(8);
        let (tx_new, mut rx_new) = channel(8);
        let cancel_old = CancellationToken::new();

        let old_id = reg
            .register(convo.clone(), alice.clone(), tx_old, cancel_old.clone())
            .await;
        reg.register(convo.clone(), alice.clone(), tx_new, CancellationToken::new())
            .await;
        reg.set_state(&convo, &alice, ConnectionState::Open).await;

        assert!(cancel_old.is_cancelled(), "old connection closed");

        // Only one live connection for alice
        let delivered = reg.broadcast(&convo, &typing_frame("x")).await;
        assert_eq!(delivered.len(), 1);
        assert!(rx_new.try_recv().is_ok());

        // The stale socket task's unregister is a no-op
        assert!(!reg.unregister(&convo, &alice, old_id).await);
        assert_eq!(reg.connection_count().await, 1);
    }

    #[tokio::test]
    async fn send_buffer_overflow_closes_connection() {
        let reg = registry();
        let convo = ConversationId::new("c1");
        let cancel = CancellationToken::new();
        // Capacity 1 and no reader: second frame overflows.
        let (tx, _rx) = channel(1);
        reg.register(convo.clone(), ParticipantId::new("slow"), tx, cancel.clone())
            .await;
        reg.set_state(&convo, &ParticipantId::new("slow"), ConnectionState::Open)
            .await;

        reg.broadcast(&convo, &typing_frame("x")).await;
        let delivered = reg.broadcast(&convo, &typing_frame("y")).await;

        assert!(delivered.is_empty());
        assert!(cancel.is_cancelled());
        assert_eq!(reg.connection_count().await, 0);
    }

    #[tokio::test]
    async fn sweep_removes_silent_connections() {
        let reg = registry();
        let convo = ConversationId::new("c1");
        let cancel = CancellationToken::new();
        let (tx, _rx) = channel(8);
        reg.register(convo.clone(), ParticipantId::new("ghost"), tx, cancel.clone())
            .await;

        // Zero timeout: everything is stale.
        let dead = reg.sweep_dead(Duration::from_secs(0)).await;
        assert_eq!(dead.len(), 1);
        assert!(cancel.is_cancelled());
        assert_eq!(reg.connection_count().await, 0);

        // Swept connections are excluded from subsequent broadcasts
        let delivered = reg.broadcast(&convo, &typing_frame("x")).await;
        assert!(delivered.is_empty());
    }

    #[tokio::test]
    async fn fresh_connection_survives_sweep() {
        let reg = registry();
        let (tx, _rx) = channel(8);
        reg.register(
            ConversationId::new("c1"),
            ParticipantId::new("alice"),
            tx,
            CancellationToken::new(),
        )
        .await;

        let dead = reg.sweep_dead(Duration::from_secs(600)).await;
        assert!(dead.is_empty());
        assert_eq!(reg.connection_count().await, 1);
    }

    #[tokio::test]
    async fn closed_state_is_terminal() {
        let reg = registry();
        let convo = ConversationId::new("c1");
        let alice = ParticipantId::new("alice");
        let (tx, _rx) = channel(8);
        reg.register(convo.clone(), alice.clone(), tx, CancellationToken::new())
            .await;

        reg.set_state(&convo, &alice, ConnectionState::Closed).await;
        reg.set_state(&convo, &alice, ConnectionState::Open).await;
        assert_eq!(
            reg.state_of(&convo, &alice).await,
            Some(ConnectionState::Closed)
        );
    }
}
