//! End-to-end conversation flows driven through the library API, with
//! channel-backed connections standing in for WebSocket clients.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use parley_hub::config::HubConfig;
use parley_hub::error::HubError;
use parley_hub::hub::{ConversationHandle, HubManager};
use parley_hub::metrics::HubMetrics;
use parley_hub::responder::testing::{EchoResponder, StalledResponder};
use parley_hub::responder::AgentRegistration;
use parley_hub::storage::testing::FlakyStorage;
use parley_hub::storage::{MemoryStorage, Storage};
use parley_protocol::{
    ConnectionState, ConversationId, ParticipantId, ParticipantKind, ServerFrame,
};

struct TestClient {
    id: ParticipantId,
    rx: mpsc::Receiver<ServerFrame>,
    cancel: CancellationToken,
}

impl TestClient {
    /// Next frame, or panic if none arrives in time.
    async fn recv(&mut self) -> ServerFrame {
        tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("connection channel closed")
    }

    /// Drain every frame already delivered, without waiting.
    fn drain(&mut self) -> Vec<ServerFrame> {
        let mut out = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            out.push(frame);
        }
        out
    }

    /// Wait until a chat message matching the predicate arrives,
    /// ignoring everything else.
    async fn next_message_where(
        &mut self,
        pred: impl Fn(&parley_protocol::Message) -> bool,
    ) -> parley_protocol::Message {
        loop {
            if let ServerFrame::Message { message } = self.recv().await {
                if pred(&message) {
                    return message;
                }
            }
        }
    }
}

fn manager_with(config: HubConfig, storage: Arc<dyn Storage>) -> Arc<HubManager> {
    HubManager::new(config, storage, Arc::new(HubMetrics::new()))
}

/// Register a connection and join the conversation, mirroring what the
/// WebSocket handler does.
async fn attach(
    manager: &Arc<HubManager>,
    conversation: &ConversationId,
    name: &str,
) -> (ConversationHandle, TestClient) {
    let id = ParticipantId::new(name);
    let (tx, rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    manager
        .registry()
        .register(conversation.clone(), id.clone(), tx, cancel.clone())
        .await;

    let handle = manager.get_or_create(conversation).await;
    handle
        .join(id.clone(), ParticipantKind::Human, name.to_string())
        .await
        .expect("join");
    manager
        .registry()
        .set_state(conversation, &id, ConnectionState::Open)
        .await;

    (handle, TestClient { id, rx, cancel })
}

fn message_seqs(frames: &[ServerFrame]) -> Vec<u64> {
    frames
        .iter()
        .filter_map(|f| match f {
            ServerFrame::Message { message } => Some(message.sequence_id),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn all_participants_see_identical_gapless_order() {
    let manager = manager_with(HubConfig::default(), Arc::new(MemoryStorage::new()));
    let convo = ConversationId::new("room");

    let (handle, mut alice) = attach(&manager, &convo, "alice").await;
    let (_, mut bob) = attach(&manager, &convo, "bob").await;

    for i in 0..5 {
        handle
            .submit(alice.id.clone(), format!("msg {}", i), format!("cm-{}", i))
            .await
            .expect("submit");
    }
    // Broadcast happens before submit resolves, so the frames are
    // already queued.
    let alice_frames = alice.drain();
    let bob_frames = bob.drain();

    let alice_seqs = message_seqs(&alice_frames);
    let bob_seqs = message_seqs(&bob_frames);

    // Bob attached after alice did, so alice may have seen earlier
    // frames; on the shared suffix both orders must agree exactly.
    assert!(bob_seqs.len() >= 5);
    assert!(alice_seqs.ends_with(&bob_seqs));

    // Gapless and strictly increasing.
    for window in bob_seqs.windows(2) {
        assert_eq!(window[1], window[0] + 1);
    }
}

#[tokio::test]
async fn duplicate_submission_resolves_to_original_sequence() {
    let manager = manager_with(HubConfig::default(), Arc::new(MemoryStorage::new()));
    let convo = ConversationId::new("room");
    let (handle, mut alice) = attach(&manager, &convo, "alice").await;

    let first = handle
        .submit(alice.id.clone(), "hello".into(), "cm-dup".into())
        .await
        .expect("first submit");
    let second = handle
        .submit(alice.id.clone(), "hello".into(), "cm-dup".into())
        .await
        .expect("retry submit");
    assert_eq!(first, second);

    // Exactly one broadcast carries that client id.
    let frames = alice.drain();
    let hits = frames
        .iter()
        .filter(|f| matches!(f, ServerFrame::Message { message } if message.client_message_id == "cm-dup"))
        .count();
    assert_eq!(hits, 1);

    let metrics = manager.metrics();
    assert_eq!(metrics.duplicates_resolved.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn agent_reply_is_sequenced_and_broadcast() {
    let manager = manager_with(HubConfig::default(), Arc::new(MemoryStorage::new()));
    manager
        .register_agent(AgentRegistration::new(
            "helper",
            "Helper",
            Arc::new(EchoResponder {
                prefix: "echo: ".into(),
            }),
        ))
        .await;

    let convo = ConversationId::new("room");
    let (handle, mut alice) = attach(&manager, &convo, "alice").await;

    let human_seq = handle
        .submit(alice.id.clone(), "ping".into(), "cm-1".into())
        .await
        .expect("submit");

    let reply = alice
        .next_message_where(|m| m.sender_kind == ParticipantKind::Agent)
        .await;
    assert_eq!(reply.sender_id, ParticipantId::new("helper"));
    assert_eq!(reply.content, "echo: ping");
    assert!(reply.sequence_id > human_seq);
}

#[tokio::test]
async fn stalled_agent_times_out_and_turn_is_dropped() {
    let config = HubConfig {
        agent_timeout: Duration::from_millis(100),
        ..HubConfig::default()
    };
    let manager = manager_with(config, Arc::new(MemoryStorage::new()));
    manager
        .register_agent(AgentRegistration::new(
            "sleepy",
            "Sleepy",
            Arc::new(StalledResponder),
        ))
        .await;

    let convo = ConversationId::new("room");
    let (handle, mut alice) = attach(&manager, &convo, "alice").await;

    handle
        .submit(alice.id.clone(), "anyone there?".into(), "cm-1".into())
        .await
        .expect("submit");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let frames = alice.drain();
    assert!(
        !frames.iter().any(|f| matches!(
            f,
            ServerFrame::Message { message } if message.sender_kind == ParticipantKind::Agent
        )),
        "no agent reply expected after timeout"
    );
    assert_eq!(manager.metrics().agent_timeouts.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn resync_replays_missed_range_then_resumes_live() {
    let manager = manager_with(HubConfig::default(), Arc::new(MemoryStorage::new()));
    let convo = ConversationId::new("room");

    let (handle, mut alice) = attach(&manager, &convo, "alice").await;
    let (_, mut bob) = attach(&manager, &convo, "bob").await;

    handle
        .submit(alice.id.clone(), "one".into(), "cm-1".into())
        .await
        .expect("submit");
    handle
        .submit(alice.id.clone(), "two".into(), "cm-2".into())
        .await
        .expect("submit");

    // Bob drops and comes back knowing nothing.
    let bob_id = bob.id.clone();
    drop(bob);
    let (tx, rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    manager
        .registry()
        .register(convo.clone(), bob_id.clone(), tx, cancel.clone())
        .await;
    manager
        .registry()
        .set_state(&convo, &bob_id, ConnectionState::Syncing)
        .await;
    handle.sync(bob_id.clone(), 0).await;

    let mut bob = TestClient {
        id: bob_id,
        rx,
        cancel,
    };
    let sync = loop {
        match bob.recv().await {
            ServerFrame::Sync {
                messages,
                current_sequence_id,
                sync_incomplete,
                ..
            } => break (messages, current_sequence_id, sync_incomplete),
            _ => continue,
        }
    };
    let (messages, current, incomplete) = sync;
    assert!(!incomplete);
    let seqs: Vec<u64> = messages.iter().map(|m| m.sequence_id).collect();
    assert_eq!(seqs, (1..=current).collect::<Vec<u64>>());
    assert!(messages.iter().any(|m| m.content == "one"));
    assert!(messages.iter().any(|m| m.content == "two"));

    // The sync reply flipped bob back to Open; live traffic resumes
    // on the same channel, strictly after the replayed range.
    let next = handle
        .submit(alice.id.clone(), "three".into(), "cm-3".into())
        .await
        .expect("submit");
    let live = bob.next_message_where(|m| m.content == "three").await;
    assert_eq!(live.sequence_id, next);
    assert!(live.sequence_id > current);

    let _ = alice.drain();
}

#[tokio::test]
async fn resync_is_flagged_incomplete_when_history_is_unreachable() {
    let config = HubConfig {
        replay_buffer_entries: 1,
        ..HubConfig::default()
    };
    let storage = Arc::new(FlakyStorage::default());
    let manager = manager_with(config, storage.clone());
    let convo = ConversationId::new("room");

    let (handle, mut alice) = attach(&manager, &convo, "alice").await;
    for i in 0..3 {
        handle
            .submit(alice.id.clone(), format!("msg {}", i), format!("cm-{}", i))
            .await
            .expect("submit");
    }

    // The buffer only holds the newest entry and storage is down.
    storage.fail_load.store(true, Ordering::Relaxed);
    manager
        .registry()
        .set_state(&convo, &alice.id, ConnectionState::Syncing)
        .await;
    handle.sync(alice.id.clone(), 0).await;

    let incomplete = loop {
        match alice.recv().await {
            ServerFrame::Sync { sync_incomplete, .. } => break sync_incomplete,
            _ => continue,
        }
    };
    assert!(incomplete, "partial history must be flagged");
    assert!(manager.metrics().resyncs_incomplete.load(Ordering::Relaxed) >= 1);
}

#[tokio::test]
async fn reconnect_supersedes_previous_connection() {
    let manager = manager_with(HubConfig::default(), Arc::new(MemoryStorage::new()));
    let convo = ConversationId::new("room");
    let (_, old) = attach(&manager, &convo, "alice").await;

    let (tx, _rx) = mpsc::channel(64);
    let new_cancel = CancellationToken::new();
    let new_id = manager
        .registry()
        .register(convo.clone(), old.id.clone(), tx, new_cancel.clone())
        .await;

    // Old socket's task gets cancelled and its late unregister is a
    // no-op against the replacement.
    assert!(old.cancel.is_cancelled());
    assert!(!new_cancel.is_cancelled());
    let removed = manager
        .registry()
        .unregister(&convo, &old.id, uuid::Uuid::new_v4())
        .await;
    assert!(!removed);
    assert_eq!(manager.registry().connection_count().await, 1);

    let removed = manager.registry().unregister(&convo, &old.id, new_id).await;
    assert!(removed);
    assert_eq!(
        manager.metrics().connections_superseded.load(Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn conversation_rejects_joins_past_participant_limit() {
    let config = HubConfig {
        max_participants: 2,
        ..HubConfig::default()
    };
    let manager = manager_with(config, Arc::new(MemoryStorage::new()));
    let convo = ConversationId::new("room");

    let (handle, _alice) = attach(&manager, &convo, "alice").await;
    let (_, _bob) = attach(&manager, &convo, "bob").await;

    let result = handle
        .join(
            ParticipantId::new("carol"),
            ParticipantKind::Human,
            "Carol".into(),
        )
        .await;
    assert!(matches!(result, Err(HubError::ConversationFull { limit: 2 })));
}

#[tokio::test]
async fn typing_is_relayed_but_never_sequenced() {
    let manager = manager_with(HubConfig::default(), Arc::new(MemoryStorage::new()));
    let convo = ConversationId::new("room");

    let (handle, mut alice) = attach(&manager, &convo, "alice").await;
    let (_, mut bob) = attach(&manager, &convo, "bob").await;
    let _ = bob.drain();

    handle.typing(alice.id.clone(), true).await;
    // Force the actor to have processed the typing relay.
    let seq = handle
        .submit(alice.id.clone(), "done typing".into(), "cm-1".into())
        .await
        .expect("submit");

    let frames = bob.drain();
    let typing_seen = frames.iter().any(|f| {
        matches!(f, ServerFrame::Typing { participant, is_typing: true } if *participant == alice.id)
    });
    assert!(typing_seen);

    // The indicator consumed no sequence id: the join notices for two
    // participants took 1 and 2, the message took 3.
    assert_eq!(seq, 3);
    let _ = alice.drain();
}
