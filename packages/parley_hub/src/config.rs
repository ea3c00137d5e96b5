use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / parley.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   parley.toml:     [hub]
//                    queue_size = 500
//
//   env var:         PARLEY_HUB__QUEUE_SIZE=500   (double underscore = nesting)
//
//   (single underscore stays within field names: PARLEY_HUB__AGENT_TIMEOUT_SECS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub hub: HubFileConfig,
}

/// Server bind knobs (lives under `[server]` in parley.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
        }
    }
}

/// Conversation hub tunables (lives under `[hub]` in parley.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HubFileConfig {
    /// Per-conversation in-flight work bound.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_max_participants")]
    pub max_participants: usize,
    /// Per-turn agent responder timeout.
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    /// Liveness probe interval. Clamped to 30-60s at resolve time.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// A connection silent for longer than this is force-closed.
    #[serde(default = "default_dead_connection_timeout_mins")]
    pub dead_connection_timeout_mins: u64,
    /// Idle conversations are evicted from memory after this long.
    /// Storage retains history independently.
    #[serde(default = "default_idle_ttl_mins")]
    pub idle_ttl_mins: u64,
    /// Bound on concurrently resident conversations (LRU beyond it).
    #[serde(default = "default_max_conversations")]
    pub max_conversations: usize,
    /// In-memory replay buffer capacity per conversation.
    #[serde(default = "default_replay_buffer_entries")]
    pub replay_buffer_entries: usize,
    /// Retry window for client_message_id de-duplication.
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    /// Per-connection outbound frame buffer; overflow closes the
    /// connection rather than stalling the broadcast.
    #[serde(default = "default_send_buffer_frames")]
    pub send_buffer_frames: usize,
    /// How many trailing messages an agent responder sees per turn.
    #[serde(default = "default_agent_context_messages")]
    pub agent_context_messages: usize,
}

impl Default for HubFileConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            max_participants: default_max_participants(),
            agent_timeout_secs: default_agent_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            dead_connection_timeout_mins: default_dead_connection_timeout_mins(),
            idle_ttl_mins: default_idle_ttl_mins(),
            max_conversations: default_max_conversations(),
            replay_buffer_entries: default_replay_buffer_entries(),
            dedup_window_secs: default_dedup_window_secs(),
            send_buffer_frames: default_send_buffer_frames(),
            agent_context_messages: default_agent_context_messages(),
        }
    }
}

fn default_queue_size() -> usize {
    1000
}

fn default_max_participants() -> usize {
    100
}

fn default_agent_timeout_secs() -> u64 {
    20
}

fn default_heartbeat_interval_secs() -> u64 {
    45
}

fn default_dead_connection_timeout_mins() -> u64 {
    10
}

fn default_idle_ttl_mins() -> u64 {
    60
}

fn default_max_conversations() -> usize {
    1024
}

fn default_replay_buffer_entries() -> usize {
    1000
}

fn default_dedup_window_secs() -> u64 {
    300
}

fn default_send_buffer_frames() -> usize {
    256
}

fn default_agent_context_messages() -> usize {
    50
}

/// Resolved hub configuration (runtime view, durations materialized).
#[derive(Clone, Debug)]
pub struct HubConfig {
    pub queue_size: usize,
    pub max_participants: usize,
    pub agent_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub dead_connection_timeout: Duration,
    pub idle_ttl: Duration,
    pub max_conversations: usize,
    pub replay_buffer_entries: usize,
    pub dedup_window: Duration,
    pub send_buffer_frames: usize,
    pub agent_context_messages: usize,
}

impl HubConfig {
    pub fn from_file(fc: &HubFileConfig) -> Self {
        // The probe interval has a specified operating range.
        let heartbeat_secs = fc.heartbeat_interval_secs.clamp(30, 60);
        Self {
            queue_size: fc.queue_size.max(1),
            max_participants: fc.max_participants.max(2),
            agent_timeout: Duration::from_secs(fc.agent_timeout_secs),
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            dead_connection_timeout: Duration::from_secs(fc.dead_connection_timeout_mins * 60),
            idle_ttl: Duration::from_secs(fc.idle_ttl_mins * 60),
            max_conversations: fc.max_conversations.max(1),
            replay_buffer_entries: fc.replay_buffer_entries.max(1),
            dedup_window: Duration::from_secs(fc.dedup_window_secs),
            send_buffer_frames: fc.send_buffer_frames.max(1),
            agent_context_messages: fc.agent_context_messages.max(1),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from_file(&HubFileConfig::default())
    }
}

/// Load configuration: built-in defaults, then `parley.toml` (if
/// present), then `PARLEY_*` environment variables.
pub fn load_config(config_path: Option<&Path>) -> Result<FileConfig> {
    use figment::Figment;
    use figment::providers::{Env, Format, Serialized, Toml};

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));

    if let Some(path) = config_path {
        info!(path = %path.display(), "Loading config file");
        figment = figment.merge(Toml::file(path));
    } else {
        figment = figment.merge(Toml::file("parley.toml"));
    }

    figment
        .merge(Env::prefixed("PARLEY_").split("__"))
        .extract()
        .context("Failed to load configuration")
}
