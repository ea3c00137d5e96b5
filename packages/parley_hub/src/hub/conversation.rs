//! Conversation orchestrator.
//!
//! One actor task per conversation. The actor owns all mutable
//! conversation state (roster, admission queue, replay buffer, dedup
//! window) and processes commands from a single mailbox, which
//! serializes admission, sequencing and broadcast for that
//! conversation while distinct conversations run fully in parallel.
//! Concurrent sends are resolved by mailbox arrival order; client
//! timestamps are never consulted.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::error::HubError;
use crate::hub::connections::ConnectionRegistry;
use crate::hub::queue::{AdmissionQueue, JobKind, JobTicket};
use crate::hub::replay::{Replay, ReplayBuffer};
use crate::hub::participants::Roster;
use crate::hub::sequencer::Sequencer;
use crate::metrics::HubMetrics;
use crate::responder::AgentRegistration;
use crate::storage::Storage;
use parley_protocol::{
    ConnectionState, ConversationId, ConversationMode, Message, MessageStatus, ParticipantId,
    ParticipantInfo, ParticipantKind, ServerFrame,
};

/// Sender id attached to hub-generated system notices.
const SYSTEM_SENDER: &str = "system";

/// Commands that can be sent to a conversation actor
pub enum ConvoCommand {
    Join {
        participant_id: ParticipantId,
        kind: ParticipantKind,
        display_name: String,
        respond_to: oneshot::Sender<Result<JoinInfo, HubError>>,
    },
    Leave {
        participant_id: ParticipantId,
    },
    /// An inbound message (human over the wire, or an agent reply
    /// re-entering the same path). `respond_to` is None for agent
    /// replies: nobody is waiting on the wire for them.
    Inbound {
        sender_id: ParticipantId,
        content: String,
        client_message_id: String,
        respond_to: Option<oneshot::Sender<Result<u64, HubError>>>,
    },
    Sync {
        participant_id: ParticipantId,
        last_sequence_id: u64,
    },
    Typing {
        participant_id: ParticipantId,
        is_typing: bool,
    },
    Snapshot {
        respond_to: oneshot::Sender<ConversationSnapshot>,
    },
    Stop {
        respond_to: oneshot::Sender<()>,
    },
}

/// What a joining client needs to render the conversation.
#[derive(Debug, Clone)]
pub struct JoinInfo {
    pub participants: Vec<ParticipantInfo>,
    pub mode: ConversationMode,
    pub last_sequence_id: u64,
}

/// Point-in-time view of a conversation's state.
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    pub conversation_id: ConversationId,
    pub participants: Vec<ParticipantInfo>,
    pub mode: ConversationMode,
    pub queue_depth: usize,
    pub queue_limit: usize,
    pub last_sequence_id: u64,
    pub last_activity: DateTime<Utc>,
}

/// Handle to communicate with a conversation actor
#[derive(Clone)]
pub struct ConversationHandle {
    conversation_id: ConversationId,
    sender: mpsc::Sender<ConvoCommand>,
}

impl ConversationHandle {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub async fn join(
        &self,
        participant_id: ParticipantId,
        kind: ParticipantKind,
        display_name: String,
    ) -> Result<JoinInfo, HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConvoCommand::Join {
                participant_id,
                kind,
                display_name,
                respond_to: tx,
            })
            .await
            .map_err(|_| HubError::ConversationClosed)?;
        rx.await.map_err(|_| HubError::ConversationClosed)?
    }

    pub async fn leave(&self, participant_id: ParticipantId) {
        let _ = self.sender.send(ConvoCommand::Leave { participant_id }).await;
    }

    /// Submit a message and wait for its sequence id (or rejection).
    pub async fn submit(
        &self,
        sender_id: ParticipantId,
        content: String,
        client_message_id: String,
    ) -> Result<u64, HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConvoCommand::Inbound {
                sender_id,
                content,
                client_message_id,
                respond_to: Some(tx),
            })
            .await
            .map_err(|_| HubError::ConversationClosed)?;
        rx.await.map_err(|_| HubError::ConversationClosed)?
    }

    /// Request a resync; the reply frame is delivered on the
    /// participant's connection, ordered against live broadcasts.
    pub async fn sync(&self, participant_id: ParticipantId, last_sequence_id: u64) {
        let _ = self
            .sender
            .send(ConvoCommand::Sync {
                participant_id,
                last_sequence_id,
            })
            .await;
    }

    pub async fn typing(&self, participant_id: ParticipantId, is_typing: bool) {
        let _ = self
            .sender
            .send(ConvoCommand::Typing {
                participant_id,
                is_typing,
            })
            .await;
    }

    pub async fn snapshot(&self) -> Result<ConversationSnapshot, HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConvoCommand::Snapshot { respond_to: tx })
            .await
            .map_err(|_| HubError::ConversationClosed)?;
        rx.await.map_err(|_| HubError::ConversationClosed)
    }

    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ConvoCommand::Stop { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

/// Shared services a conversation actor is wired to.
#[derive(Clone)]
pub struct ConvoServices {
    pub registry: Arc<ConnectionRegistry>,
    pub sequencer: Arc<Sequencer>,
    pub storage: Arc<dyn Storage>,
    pub metrics: Arc<HubMetrics>,
    pub config: Arc<HubConfig>,
    pub agents: Vec<AgentRegistration>,
}

/// The conversation actor
struct ConversationActor {
    conversation_id: ConversationId,
    services: ConvoServices,
    receiver: mpsc::Receiver<ConvoCommand>,
    /// Clone of the mailbox sender, used by agent dispatch tasks to
    /// re-enter replies through the normal inbound path.
    self_sender: mpsc::Sender<ConvoCommand>,
    roster: Roster,
    queue: AdmissionQueue,
    replay: ReplayBuffer,
    /// client_message_id -> (sequence_id, first seen). Bounded by the
    /// retry window.
    dedup: HashMap<String, (u64, Instant)>,
    last_mode: ConversationMode,
    last_activity: DateTime<Utc>,
    last_sequence_id: u64,
}

impl ConversationActor {
    /// Spawn a conversation actor and return its handle. Never
    /// awaits: history seeding runs inside the actor task, before its
    /// first command, so a slow storage backend delays only this
    /// conversation.
    pub fn spawn(conversation_id: ConversationId, services: ConvoServices) -> ConversationHandle {
        let (sender, receiver) = mpsc::channel(64);

        let mut roster = Roster::new(services.config.max_participants);
        for agent in &services.agents {
            // Registered agents are standing participants of every
            // conversation this hub hosts.
            let _ = roster.join(
                agent.id.clone(),
                ParticipantKind::Agent,
                agent.display_name.clone(),
            );
        }

        let mut actor = ConversationActor {
            conversation_id: conversation_id.clone(),
            queue: AdmissionQueue::new(services.config.queue_size),
            replay: ReplayBuffer::new(services.config.replay_buffer_entries),
            roster,
            services,
            receiver,
            self_sender: sender.clone(),
            dedup: HashMap::new(),
            last_mode: ConversationMode::Single,
            last_activity: Utc::now(),
            last_sequence_id: 0,
        };

        tokio::spawn(async move {
            actor.seed_history().await;
            actor.run().await;
        });

        ConversationHandle {
            conversation_id,
            sender,
        }
    }

    /// Seed the sequencer and replay buffer from persisted history so
    /// a conversation evicted and recreated continues its sequence
    /// instead of restarting at 1. Commands queue in the mailbox until
    /// this finishes.
    async fn seed_history(&mut self) {
        match self
            .services
            .storage
            .load_range(&self.conversation_id, 0)
            .await
        {
            Ok(history) => {
                if let Some(last) = history.last() {
                    self.last_sequence_id = last.sequence_id;
                    self.services
                        .sequencer
                        .resume(&self.conversation_id, last.sequence_id)
                        .await;
                }
                for message in history {
                    self.replay.push(message);
                }
            }
            Err(e) => {
                // Fresh start; resync will report incompleteness if a
                // client asks for the missing range.
                warn!(conversation = %self.conversation_id, "Could not seed history: {}", e);
            }
        }
    }

    async fn run(mut self) {
        debug!(conversation = %self.conversation_id, "Conversation actor started");

        while let Some(cmd) = self.receiver.recv().await {
            match cmd {
                ConvoCommand::Join {
                    participant_id,
                    kind,
                    display_name,
                    respond_to,
                } => {
                    let result = self.handle_join(participant_id, kind, display_name).await;
                    let _ = respond_to.send(result);
                }
                ConvoCommand::Leave { participant_id } => {
                    self.handle_leave(participant_id).await;
                }
                ConvoCommand::Inbound {
                    sender_id,
                    content,
                    client_message_id,
                    respond_to,
                } => {
                    let result = self
                        .handle_inbound(sender_id, content, client_message_id)
                        .await;
                    if let Err(ref e) = result {
                        debug!(conversation = %self.conversation_id, "Inbound rejected: {}", e);
                    }
                    if let Some(respond_to) = respond_to {
                        let _ = respond_to.send(result);
                    }
                }
                ConvoCommand::Sync {
                    participant_id,
                    last_sequence_id,
                } => {
                    self.handle_sync(participant_id, last_sequence_id).await;
                }
                ConvoCommand::Typing {
                    participant_id,
                    is_typing,
                } => {
                    // Relayed, never sequenced or queued.
                    self.roster.touch(&participant_id);
                    let frame = ServerFrame::Typing {
                        participant: participant_id,
                        is_typing,
                    };
                    self.services
                        .registry
                        .broadcast(&self.conversation_id, &frame)
                        .await;
                }
                ConvoCommand::Snapshot { respond_to } => {
                    let _ = respond_to.send(self.snapshot());
                }
                ConvoCommand::Stop { respond_to } => {
                    info!(conversation = %self.conversation_id, "Conversation actor stopping");
                    let _ = respond_to.send(());
                    break;
                }
            }
        }

        debug!(conversation = %self.conversation_id, "Conversation actor stopped");
    }

    async fn handle_join(
        &mut self,
        participant_id: ParticipantId,
        kind: ParticipantKind,
        display_name: String,
    ) -> Result<JoinInfo, HubError> {
        self.last_activity = Utc::now();
        let rejoined = self.roster.contains(&participant_id);
        self.roster
            .join(participant_id.clone(), kind, display_name.clone())?;

        info!(
            conversation = %self.conversation_id,
            participant = %participant_id,
            rejoined,
            "Participant joined"
        );

        self.broadcast_participant_update().await;
        if !rejoined {
            self.system_notice(format!("{} joined the conversation", display_name))
                .await;
        }

        Ok(JoinInfo {
            participants: self.roster.list(),
            mode: self.current_mode(),
            last_sequence_id: self.services.sequencer.last(&self.conversation_id).await,
        })
    }

    async fn handle_leave(&mut self, participant_id: ParticipantId) {
        self.last_activity = Utc::now();
        let display_name = self
            .roster
            .get(&participant_id)
            .map(|p| p.display_name.clone());
        self.roster.mark_offline(&participant_id);

        if let Some(name) = display_name {
            info!(
                conversation = %self.conversation_id,
                participant = %participant_id,
                "Participant left"
            );
            self.broadcast_participant_update().await;
            self.system_notice(format!("{} left the conversation", name))
                .await;
        }
    }

    /// The inbound pipeline: dedup, admit, sequence, broadcast,
    /// persist, dispatch. Steps up to broadcast run inline so no two
    /// messages of this conversation can interleave their sequence
    /// assignment and delivery.
    async fn handle_inbound(
        &mut self,
        sender_id: ParticipantId,
        content: String,
        client_message_id: String,
    ) -> Result<u64, HubError> {
        self.last_activity = Utc::now();
        self.prune_dedup();

        // 1. At-least-once retries resolve to the original sequence id.
        if let Some((seq, _)) = self.dedup.get(&client_message_id) {
            self.services.metrics.duplicate_resolved();
            debug!(
                conversation = %self.conversation_id,
                client_message_id,
                seq,
                "Duplicate submission resolved"
            );
            return Ok(*seq);
        }

        let sender_kind = self
            .roster
            .get(&sender_id)
            .map(|p| p.kind)
            .unwrap_or(ParticipantKind::Human);
        self.roster.touch(&sender_id);

        // 2. Admission before any sequence id exists: a rejected
        // message leaves no trace in the order.
        let job_kind = match sender_kind {
            ParticipantKind::Human => JobKind::Human,
            ParticipantKind::Agent => JobKind::Agent,
            ParticipantKind::System => JobKind::System,
        };
        let evictions_before = self.queue.evictions();
        let ticket = self.queue.admit(job_kind).inspect_err(|_| {
            self.services.metrics.queue_rejection();
        })?;
        let evicted = self.queue.evictions() - evictions_before;
        if evicted > 0 {
            for _ in 0..evicted {
                self.services.metrics.queue_eviction();
            }
        }

        // 3. Sequence and freeze the message.
        let sequence_id = self.services.sequencer.next(&self.conversation_id).await;
        self.last_sequence_id = sequence_id;
        let message = Message {
            sequence_id,
            conversation_id: self.conversation_id.clone(),
            sender_id: sender_id.clone(),
            sender_kind,
            content,
            client_message_id: client_message_id.clone(),
            created_at: Utc::now(),
            status: MessageStatus::Delivered,
        };
        self.dedup
            .insert(client_message_id, (sequence_id, Instant::now()));
        self.services.metrics.message_sequenced();

        // 4. Delivery first: broadcast before persistence.
        self.replay.push(message.clone());
        let frame = ServerFrame::Message {
            message: message.clone(),
        };
        self.services
            .registry
            .broadcast(&self.conversation_id, &frame)
            .await;

        // 5. Best-effort persistence off the critical path. The ticket
        // rides along so the slot stays occupied until the write
        // settles.
        self.spawn_persist(message.clone(), ticket);

        // 6. Agent dispatch: every registered responder, concurrently,
        // each under its own timeout and eviction token. Agents do not
        // answer themselves or other agents' replies.
        if sender_kind == ParticipantKind::Human {
            self.dispatch_agents(&sender_id).await;
        }

        // 7. Mode may flip when the first message after a roster
        // change lands.
        self.broadcast_mode_if_changed().await;

        Ok(sequence_id)
    }

    fn spawn_persist(&self, message: Message, ticket: JobTicket) {
        let storage = self.services.storage.clone();
        let metrics = self.services.metrics.clone();
        tokio::spawn(async move {
            crate::storage::store_with_retry(storage.as_ref(), &message, metrics.as_ref()).await;
            drop(ticket);
        });
    }

    async fn dispatch_agents(&self, human_sender: &ParticipantId) {
        if self.services.agents.is_empty() {
            return;
        }

        // Context window snapshot: trailing messages, newest last.
        let context = {
            let window = self.services.config.agent_context_messages;
            match self.replay.replay_since(0) {
                Replay::Complete(messages) | Replay::Partial(messages) => {
                    let skip = messages.len().saturating_sub(window);
                    messages.into_iter().skip(skip).collect::<Vec<_>>()
                }
            }
        };

        for agent in &self.services.agents {
            if &agent.id == human_sender {
                continue;
            }
            let ticket = match self.queue.admit(JobKind::Agent) {
                Ok(ticket) => ticket,
                Err(_) => {
                    // Queue saturated with same-or-higher priority
                    // work; this agent turn is skipped, not queued.
                    debug!(
                        conversation = %self.conversation_id,
                        agent = %agent.id,
                        "Agent turn skipped, queue full"
                    );
                    continue;
                }
            };

            let agent = agent.clone();
            let conversation_id = self.conversation_id.clone();
            let context = context.clone();
            let timeout = self.services.config.agent_timeout;
            let metrics = self.services.metrics.clone();
            let mailbox = self.self_sender.clone();
            let evicted = ticket.cancellation();

            tokio::spawn(async move {
                let reply = tokio::select! {
                    _ = evicted.cancelled() => {
                        debug!(
                            conversation = %conversation_id,
                            agent = %agent.id,
                            "Agent turn evicted under queue pressure"
                        );
                        None
                    }
                    outcome = tokio::time::timeout(
                        timeout,
                        agent.responder.respond(&conversation_id, &context),
                    ) => match outcome {
                        Ok(reply) => reply,
                        Err(_) => {
                            metrics.agent_timeout();
                            warn!(
                                conversation = %conversation_id,
                                agent = %agent.id,
                                "Agent timed out after {:?}, turn dropped", timeout
                            );
                            None
                        }
                    }
                };
                // Responder work is done; free the slot before the
                // reply re-enters admission as its own unit of work.
                drop(ticket);

                if let Some(content) = reply {
                    let _ = mailbox
                        .send(ConvoCommand::Inbound {
                            sender_id: agent.id,
                            content,
                            client_message_id: Uuid::new_v4().to_string(),
                            respond_to: None,
                        })
                        .await;
                }
            });
        }
    }

    /// Answer a resync with exactly the messages in
    /// `(last_sequence_id, current]`, ascending, plus the roster.
    /// Runs inline in the actor so the reply is ordered before any
    /// later broadcast; the requesting connection is in `Syncing` and
    /// receives live frames only after this reply.
    async fn handle_sync(&mut self, participant_id: ParticipantId, last_sequence_id: u64) {
        self.last_activity = Utc::now();
        let current = self.services.sequencer.last(&self.conversation_id).await;

        let (mut messages, mut incomplete) = match self.replay.replay_since(last_sequence_id) {
            Replay::Complete(messages) => (messages, false),
            Replay::Partial(tail) => {
                // Buffer does not reach back far enough; fill the gap
                // from storage.
                match self
                    .services
                    .storage
                    .load_range(&self.conversation_id, last_sequence_id)
                    .await
                {
                    Ok(stored) => {
                        let mut merged = stored;
                        let have: std::collections::HashSet<u64> =
                            merged.iter().map(|m| m.sequence_id).collect();
                        merged.extend(
                            tail.into_iter().filter(|m| !have.contains(&m.sequence_id)),
                        );
                        merged.sort_by_key(|m| m.sequence_id);
                        (merged, false)
                    }
                    Err(e) => {
                        warn!(
                            conversation = %self.conversation_id,
                            "History load failed during sync, replying partial: {}", e
                        );
                        (tail, true)
                    }
                }
            }
        };

        // Gapless check on the replayed range; a hole means some part
        // of history is gone and the client must know.
        messages.retain(|m| m.sequence_id > last_sequence_id);
        let mut expected = last_sequence_id + 1;
        for m in &messages {
            if m.sequence_id != expected {
                incomplete = true;
                break;
            }
            expected += 1;
        }
        if messages.last().map(|m| m.sequence_id).unwrap_or(last_sequence_id) < current {
            incomplete = true;
        }

        self.services.metrics.resync(incomplete);

        let frame = ServerFrame::Sync {
            messages,
            current_sequence_id: current,
            participants: self.roster.list(),
            sync_incomplete: incomplete,
        };
        self.services
            .registry
            .send_to(&self.conversation_id, &participant_id, frame)
            .await;
        // Sync reply is queued on the connection; everything broadcast
        // from here on follows it in order.
        self.services
            .registry
            .set_state(&self.conversation_id, &participant_id, ConnectionState::Open)
            .await;
        self.roster
            .set_state(&participant_id, ConnectionState::Open);
    }

    /// Sequence and broadcast a hub-generated notice. Lowest priority:
    /// dropped first under queue pressure, and silently skipped when
    /// not even that is admissible.
    async fn system_notice(&mut self, content: String) {
        let ticket = match self.queue.admit(JobKind::System) {
            Ok(ticket) => ticket,
            Err(_) => return,
        };

        let sequence_id = self.services.sequencer.next(&self.conversation_id).await;
        self.last_sequence_id = sequence_id;
        let message = Message {
            sequence_id,
            conversation_id: self.conversation_id.clone(),
            sender_id: ParticipantId::new(SYSTEM_SENDER),
            sender_kind: ParticipantKind::System,
            content,
            client_message_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            status: MessageStatus::Delivered,
        };
        self.services.metrics.message_sequenced();
        self.replay.push(message.clone());
        let frame = ServerFrame::Message {
            message: message.clone(),
        };
        self.services
            .registry
            .broadcast(&self.conversation_id, &frame)
            .await;
        self.spawn_persist(message, ticket);
    }

    fn current_mode(&self) -> ConversationMode {
        self.roster.mode()
    }

    async fn broadcast_participant_update(&mut self) {
        self.last_mode = self.current_mode();
        let frame = ServerFrame::ParticipantUpdate {
            participants: self.roster.list(),
            mode: self.last_mode,
        };
        self.services
            .registry
            .broadcast(&self.conversation_id, &frame)
            .await;
    }

    async fn broadcast_mode_if_changed(&mut self) {
        if self.current_mode() != self.last_mode {
            self.broadcast_participant_update().await;
        }
    }

    fn prune_dedup(&mut self) {
        let window = self.services.config.dedup_window;
        self.dedup.retain(|_, (_, seen)| seen.elapsed() < window);
    }

    fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            conversation_id: self.conversation_id.clone(),
            participants: self.roster.list(),
            mode: self.current_mode(),
            queue_depth: self.queue.depth(),
            queue_limit: self.queue.limit(),
            last_sequence_id: self.last_sequence_id,
            last_activity: self.last_activity,
        }
    }
}

/// Spawn a conversation actor (the manager's entry point).
pub fn spawn_conversation(
    conversation_id: ConversationId,
    services: ConvoServices,
) -> ConversationHandle {
    ConversationActor::spawn(conversation_id, services)
}
