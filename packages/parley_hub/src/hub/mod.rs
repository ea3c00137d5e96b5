//! Conversation orchestration engine.
//!
//! Actor-per-conversation: the manager owns the conversation map and
//! shared services; each conversation actor serializes its own
//! admission, sequencing and broadcast.

pub mod connections;
pub mod conversation;
pub mod manager;
pub mod participants;
pub mod queue;
pub mod replay;
pub mod sequencer;

pub use connections::ConnectionRegistry;
pub use conversation::{ConversationHandle, ConversationSnapshot, ConvoServices, JoinInfo};
pub use manager::HubManager;
pub use queue::{AdmissionQueue, JobKind};
pub use sequencer::Sequencer;
