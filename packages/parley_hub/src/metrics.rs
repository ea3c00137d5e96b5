//! Server metrics for observability
//!
//! Runtime counters for monitoring hub health; exposed as a JSON
//! snapshot at `/metrics` and summarized in `/healthz`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug)]
pub struct HubMetrics {
    // Connection metrics
    /// Currently active WebSocket connections
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,
    /// Connections closed by the dead-connection sweeper
    pub connections_reaped: AtomicU64,
    /// Connections superseded by a newer one for the same participant
    pub connections_superseded: AtomicU64,

    // Conversation metrics
    /// Currently resident conversations
    pub active_conversations: AtomicU64,
    /// Conversations evicted (idle TTL or LRU pressure)
    pub conversations_evicted: AtomicU64,

    // Message metrics
    /// Inbound messages accepted (sequence assigned)
    pub messages_sequenced: AtomicU64,
    /// Duplicate submissions resolved idempotently
    pub duplicates_resolved: AtomicU64,
    /// Frames dropped because a connection's send buffer overflowed
    pub frames_dropped: AtomicU64,

    // Backpressure metrics
    /// Admissions rejected with QUEUE_FULL
    pub queue_rejections: AtomicU64,
    /// Lower-priority jobs evicted to admit new work
    pub queue_evictions: AtomicU64,

    // Agent metrics
    /// Agent turns that exceeded their timeout
    pub agent_timeouts: AtomicU64,

    // Sync metrics
    /// Resync requests served
    pub resyncs: AtomicU64,
    /// Resyncs answered with a partial range (sync_incomplete)
    pub resyncs_incomplete: AtomicU64,

    // Error metrics
    /// Best-effort storage writes that failed after retries
    pub storage_write_failures: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Instant,
}

impl HubMetrics {
    pub fn new() -> Self {
        Self {
            active_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            connections_reaped: AtomicU64::new(0),
            connections_superseded: AtomicU64::new(0),
            active_conversations: AtomicU64::new(0),
            conversations_evicted: AtomicU64::new(0),
            messages_sequenced: AtomicU64::new(0),
            duplicates_resolved: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            queue_rejections: AtomicU64::new(0),
            queue_evictions: AtomicU64::new(0),
            agent_timeouts: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
            resyncs_incomplete: AtomicU64::new(0),
            storage_write_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_reaped(&self) {
        self.connections_reaped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_superseded(&self) {
        self.connections_superseded.fetch_add(1, Ordering::Relaxed);
    }

    // Conversation tracking
    pub fn conversation_created(&self) {
        self.active_conversations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conversation_evicted(&self) {
        self.active_conversations.fetch_sub(1, Ordering::Relaxed);
        self.conversations_evicted.fetch_add(1, Ordering::Relaxed);
    }

    // Message tracking
    pub fn message_sequenced(&self) {
        self.messages_sequenced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_resolved(&self) {
        self.duplicates_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Backpressure tracking
    pub fn queue_rejection(&self) {
        self.queue_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_eviction(&self) {
        self.queue_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn agent_timeout(&self) {
        self.agent_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resync(&self, incomplete: bool) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
        if incomplete {
            self.resyncs_incomplete.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn storage_write_failure(&self) {
        self.storage_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                reaped: self.connections_reaped.load(Ordering::Relaxed),
                superseded: self.connections_superseded.load(Ordering::Relaxed),
            },
            conversations: ConversationMetrics {
                active: self.active_conversations.load(Ordering::Relaxed),
                evicted: self.conversations_evicted.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                sequenced: self.messages_sequenced.load(Ordering::Relaxed),
                duplicates_resolved: self.duplicates_resolved.load(Ordering::Relaxed),
                frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            },
            backpressure: BackpressureMetrics {
                rejections: self.queue_rejections.load(Ordering::Relaxed),
                evictions: self.queue_evictions.load(Ordering::Relaxed),
            },
            agents: AgentMetrics {
                timeouts: self.agent_timeouts.load(Ordering::Relaxed),
            },
            sync: SyncMetrics {
                resyncs: self.resyncs.load(Ordering::Relaxed),
                incomplete: self.resyncs_incomplete.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                storage_writes: self.storage_write_failures.load(Ordering::Relaxed),
            },
        }
    }
}

impl Default for HubMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub conversations: ConversationMetrics,
    pub messages: MessageMetrics,
    pub backpressure: BackpressureMetrics,
    pub agents: AgentMetrics,
    pub sync: SyncMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
    pub reaped: u64,
    pub superseded: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMetrics {
    pub active: u64,
    pub evicted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub sequenced: u64,
    pub duplicates_resolved: u64,
    pub frames_dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureMetrics {
    pub rejections: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub timeouts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetrics {
    pub resyncs: u64,
    pub incomplete: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub storage_writes: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub conversations: u64,
    pub connections: u64,
    pub uptime_secs: u64,
}
