//! Per-conversation message sequencer.
//!
//! Issues the monotonically increasing, gapless ordinals that
//! establish the total message order within a conversation. Counters
//! are per-conversation atomics so concurrent callers in one
//! conversation serialize on a single `fetch_add` while distinct
//! conversations never contend.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use parley_protocol::ConversationId;

#[derive(Default)]
pub struct Sequencer {
    counters: RwLock<HashMap<ConversationId, Arc<AtomicU64>>>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next sequence id for a conversation. First id is 1.
    /// Infallible; ids are never reused and never skip.
    pub async fn next(&self, conversation_id: &ConversationId) -> u64 {
        let counter = self.counter(conversation_id).await;
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The last assigned id for a conversation (0 if none yet).
    pub async fn last(&self, conversation_id: &ConversationId) -> u64 {
        let counters = self.counters.read().await;
        counters
            .get(conversation_id)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Seed a conversation's counter from persisted history so that
    /// sequence ids continue instead of restarting at 1.
    pub async fn resume(&self, conversation_id: &ConversationId, last_sequence_id: u64) {
        let counter = self.counter(conversation_id).await;
        // Only ever move forward.
        counter.fetch_max(last_sequence_id, Ordering::SeqCst);
    }

    /// Drop a conversation's counter. Called only when the
    /// conversation itself is evicted from memory.
    pub async fn forget(&self, conversation_id: &ConversationId) {
        self.counters.write().await.remove(conversation_id);
    }

    async fn counter(&self, conversation_id: &ConversationId) -> Arc<AtomicU64> {
        {
            let counters = self.counters.read().await;
            if let Some(counter) = counters.get(conversation_id) {
                return counter.clone();
            }
        }
        let mut counters = self.counters.write().await;
        counters
            .entry(conversation_id.clone())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }
}
