//! Conversation map.
//!
//! Explicit lifecycle for the in-memory conversation cache: created on
//! first join, bounded by `max_conversations` (least-recently-used
//! beyond it), evicted after the idle TTL. Storage retains history
//! independently; a recreated conversation resumes its sequence from
//! there. The manager also runs the dead-connection sweeper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::HubConfig;
use crate::hub::connections::ConnectionRegistry;
use crate::hub::conversation::{
    ConversationHandle, ConversationSnapshot, ConvoServices, spawn_conversation,
};
use crate::hub::sequencer::Sequencer;
use crate::metrics::HubMetrics;
use crate::responder::AgentRegistration;
use crate::storage::Storage;
use parley_protocol::ConversationId;

struct ConvoEntry {
    handle: ConversationHandle,
    last_touch: Instant,
}

pub struct HubManager {
    config: Arc<HubConfig>,
    registry: Arc<ConnectionRegistry>,
    sequencer: Arc<Sequencer>,
    storage: Arc<dyn Storage>,
    metrics: Arc<HubMetrics>,
    agents: RwLock<Vec<AgentRegistration>>,
    conversations: RwLock<HashMap<ConversationId, ConvoEntry>>,
    shutdown: CancellationToken,
}

impl HubManager {
    pub fn new(config: HubConfig, storage: Arc<dyn Storage>, metrics: Arc<HubMetrics>) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(ConnectionRegistry::new(metrics.clone())),
            sequencer: Arc::new(Sequencer::new()),
            config: Arc::new(config),
            storage,
            metrics,
            agents: RwLock::new(Vec::new()),
            conversations: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    pub fn metrics(&self) -> Arc<HubMetrics> {
        self.metrics.clone()
    }

    pub fn config(&self) -> Arc<HubConfig> {
        self.config.clone()
    }

    /// Register an AI participant. New conversations pick it up
    /// immediately; existing actors keep the roster they were built
    /// with.
    pub async fn register_agent(&self, agent: AgentRegistration) {
        info!(agent = %agent.id, "Registering agent responder");
        self.agents.write().await.push(agent);
    }

    /// Look up a conversation, creating its actor on first join.
    pub async fn get_or_create(&self, conversation_id: &ConversationId) -> ConversationHandle {
        {
            let mut conversations = self.conversations.write().await;
            if let Some(entry) = conversations.get_mut(conversation_id) {
                entry.last_touch = Instant::now();
                return entry.handle.clone();
            }
        }

        // Not resident: enforce the bound, then spawn.
        self.evict_for_capacity().await;

        let services = ConvoServices {
            registry: self.registry.clone(),
            sequencer: self.sequencer.clone(),
            storage: self.storage.clone(),
            metrics: self.metrics.clone(),
            config: self.config.clone(),
            agents: self.agents.read().await.clone(),
        };

        let mut conversations = self.conversations.write().await;
        // Raced creation: another caller may have spawned it while we
        // were evicting.
        if let Some(entry) = conversations.get_mut(conversation_id) {
            entry.last_touch = Instant::now();
            return entry.handle.clone();
        }

        // Spawning never awaits; the actor seeds its history off this
        // lock, so a slow backend cannot stall other conversations'
        // lookups.
        let handle = spawn_conversation(conversation_id.clone(), services);
        self.metrics.conversation_created();
        info!(conversation = %conversation_id, "Conversation created");

        conversations.insert(
            conversation_id.clone(),
            ConvoEntry {
                handle: handle.clone(),
                last_touch: Instant::now(),
            },
        );
        handle
    }

    /// A resident conversation's handle, if any. Never creates.
    pub async fn get(&self, conversation_id: &ConversationId) -> Option<ConversationHandle> {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .map(|e| e.handle.clone())
    }

    pub async fn conversation_count(&self) -> usize {
        self.conversations.read().await.len()
    }

    pub async fn snapshots(&self) -> Vec<ConversationSnapshot> {
        let handles: Vec<ConversationHandle> = {
            let conversations = self.conversations.read().await;
            conversations.values().map(|e| e.handle.clone()).collect()
        };
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(snapshot) = handle.snapshot().await {
                out.push(snapshot);
            }
        }
        out
    }

    /// Evict the least-recently-touched conversation if the map is at
    /// capacity.
    async fn evict_for_capacity(&self) {
        let victim = {
            let conversations = self.conversations.read().await;
            if conversations.len() < self.config.max_conversations {
                return;
            }
            conversations
                .iter()
                .min_by_key(|(_, entry)| entry.last_touch)
                .map(|(id, _)| id.clone())
        };
        if let Some(id) = victim {
            debug!(conversation = %id, "Evicting conversation (capacity)");
            self.evict(&id).await;
        }
    }

    /// Stop a conversation's actor and release everything it holds.
    pub async fn evict(&self, conversation_id: &ConversationId) {
        let entry = self.conversations.write().await.remove(conversation_id);
        if let Some(entry) = entry {
            entry.handle.stop().await;
            self.registry.remove_conversation(conversation_id).await;
            self.sequencer.forget(conversation_id).await;
            self.metrics.conversation_evicted();
            info!(conversation = %conversation_id, "Conversation evicted");
        }
    }

    /// Spawn the idle-TTL and dead-connection sweepers. Runs until
    /// `shutdown` is triggered.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let manager = self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        manager.sweep_connections().await;
                        manager.sweep_idle_conversations().await;
                    }
                }
            }
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Force-close connections silent past the dead timeout and mark
    /// their participants offline.
    pub async fn sweep_connections(&self) {
        let dead = self
            .registry
            .sweep_dead(self.config.dead_connection_timeout)
            .await;
        for (conversation_id, participant_id) in dead {
            if let Some(handle) = self.get(&conversation_id).await {
                handle.leave(participant_id).await;
            }
        }
    }

    /// Evict conversations idle past the TTL.
    pub async fn sweep_idle_conversations(&self) {
        let snapshots = self.snapshots().await;
        let now = chrono::Utc::now();
        for snapshot in snapshots {
            let idle = (now - snapshot.last_activity)
                .to_std()
                .unwrap_or_default();
            if idle > self.config.idle_ttl {
                debug!(
                    conversation = %snapshot.conversation_id,
                    idle_secs = idle.as_secs(),
                    "Evicting conversation (idle TTL)"
                );
                self.evict(&snapshot.conversation_id).await;
            }
        }
    }
}

impl Drop for HubManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
