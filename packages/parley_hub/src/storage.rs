//! Storage collaborator interface.
//!
//! The hub never owns a storage engine; it consumes one through this
//! narrow trait. Writes are best-effort and happen off the delivery
//! path; `load_range` backs the resync path when the in-memory replay
//! buffer no longer covers the requested range.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::HubError;
use crate::metrics::HubMetrics;
use parley_protocol::{ConversationId, Message};

#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist one message. Best-effort; the caller retries with
    /// backoff and logs terminal failure, it never blocks delivery.
    async fn store(&self, message: &Message) -> Result<(), HubError>;

    /// Load all messages with `sequence_id > after`, ascending.
    async fn load_range(
        &self,
        conversation_id: &ConversationId,
        after: u64,
    ) -> Result<Vec<Message>, HubError>;
}

/// Number of store attempts before a write is declared failed.
const STORE_ATTEMPTS: u32 = 3;

/// Initial backoff between store retries (doubles per attempt).
const STORE_BACKOFF: Duration = Duration::from_millis(200);

/// Best-effort persistence with bounded retries and exponential
/// backoff. Delivery has already happened by the time this runs; a
/// terminal failure is logged and counted, never surfaced.
pub async fn store_with_retry(storage: &dyn Storage, message: &Message, metrics: &HubMetrics) {
    let mut backoff = STORE_BACKOFF;
    for attempt in 1..=STORE_ATTEMPTS {
        match storage.store(message).await {
            Ok(()) => return,
            Err(e) if attempt < STORE_ATTEMPTS => {
                warn!(
                    conversation = %message.conversation_id,
                    seq = message.sequence_id,
                    attempt,
                    "Storage write failed, retrying: {}", e
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => {
                metrics.storage_write_failure();
                warn!(
                    conversation = %message.conversation_id,
                    seq = message.sequence_id,
                    "Storage write failed permanently: {}", e
                );
            }
        }
    }
}

/// In-memory storage, keyed by conversation and ordered by sequence.
///
/// The default implementation for tests and single-node deployments
/// without a configured backend.
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<HashMap<ConversationId, Vec<Message>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, conversation_id: &ConversationId) -> usize {
        self.inner
            .read()
            .await
            .get(conversation_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store(&self, message: &Message) -> Result<(), HubError> {
        let mut inner = self.inner.write().await;
        let messages = inner
            .entry(message.conversation_id.clone())
            .or_insert_with(Vec::new);
        // Idempotent on retry: a sequence id is stored once.
        if messages
            .iter()
            .any(|m| m.sequence_id == message.sequence_id)
        {
            return Ok(());
        }
        messages.push(message.clone());
        messages.sort_by_key(|m| m.sequence_id);
        Ok(())
    }

    async fn load_range(
        &self,
        conversation_id: &ConversationId,
        after: u64,
    ) -> Result<Vec<Message>, HubError> {
        let inner = self.inner.read().await;
        Ok(inner
            .get(conversation_id)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| m.sequence_id > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

pub mod testing {
    //! Storage doubles for failure-path tests.

    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Storage whose operations can be toggled to fail.
    #[derive(Default)]
    pub struct FlakyStorage {
        pub inner: MemoryStorage,
        pub fail_store: AtomicBool,
        pub fail_load: AtomicBool,
    }

    #[async_trait]
    impl Storage for FlakyStorage {
        async fn store(&self, message: &Message) -> Result<(), HubError> {
            if self.fail_store.load(Ordering::Relaxed) {
                return Err(HubError::StorageWrite("simulated outage".into()));
            }
            self.inner.store(message).await
        }

        async fn load_range(
            &self,
            conversation_id: &ConversationId,
            after: u64,
        ) -> Result<Vec<Message>, HubError> {
            if self.fail_load.load(Ordering::Relaxed) {
                return Err(HubError::StorageLoad("simulated outage".into()));
            }
            self.inner.load_range(conversation_id, after).await
        }
    }
}
