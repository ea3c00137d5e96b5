//! WebSocket connection handler.
//!
//! One socket per participant per conversation. The socket is split
//! into a sender task (drains the bounded outbound channel, emits
//! heartbeat pings) and an input task (parses client frames and routes
//! them to the conversation actor); supersession or sweeper-initiated
//! closure cancels both through the registry's token.

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::AppState;
use parley_protocol::{
    ClientFrame, ConnectionState, ConversationId, ErrorCode, ParticipantId, ParticipantKind,
    ServerFrame,
};

/// Handshake parameters carried in the upgrade request's query string.
#[derive(Debug, Clone, Deserialize)]
pub struct WsQuery {
    pub participant_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// "human" (default) or "agent", for external agent processes
    /// that attach over the wire.
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

/// `GET /ws/{conversation_id}` upgrade endpoint.
pub async fn ws_handler(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, ConversationId::new(conversation_id), query))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    conversation_id: ConversationId,
    query: WsQuery,
) {
    let participant_id = ParticipantId::new(query.participant_id.clone());
    let metrics = state.manager.metrics();
    let config = state.manager.config();
    let registry = state.manager.registry();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Auth verdict before anything touches the registry.
    if query.participant_id.trim().is_empty()
        || !state
            .auth
            .authorize(&conversation_id, &participant_id, query.token.as_deref())
    {
        warn!(
            conversation = %conversation_id,
            participant = %participant_id,
            "Rejecting connection: auth failed"
        );
        send_frame(
            &mut ws_sender,
            &ServerFrame::Error {
                code: ErrorCode::AuthFailed,
                message: "authentication failed".to_string(),
                retry_after: None,
            },
        )
        .await;
        let _ = ws_sender.close().await;
        return;
    }

    let kind = match query.kind.as_deref() {
        Some("agent") => ParticipantKind::Agent,
        _ => ParticipantKind::Human,
    };
    let display_name = query
        .display_name
        .clone()
        .unwrap_or_else(|| query.participant_id.clone());

    metrics.connection_opened();
    info!(
        conversation = %conversation_id,
        participant = %participant_id,
        "New WebSocket connection"
    );

    // Bounded outbound channel: broadcast overflow closes us instead
    // of stalling the conversation.
    let (tx, mut rx) = mpsc::channel::<ServerFrame>(config.send_buffer_frames);
    let cancel = CancellationToken::new();

    let connection_id = registry
        .register(
            conversation_id.clone(),
            participant_id.clone(),
            tx.clone(),
            cancel.clone(),
        )
        .await;

    let handle = state.manager.get_or_create(&conversation_id).await;
    match handle
        .join(participant_id.clone(), kind, display_name)
        .await
    {
        Ok(join_info) => {
            // Welcome lands on our channel before any live broadcast
            // can (we flip to Open only afterwards). It carries the
            // current sequence id so a rejoining client can tell
            // whether it missed messages and needs a sync.
            let _ = tx
                .send(ServerFrame::Welcome {
                    participants: join_info.participants,
                    mode: join_info.mode,
                    last_sequence_id: join_info.last_sequence_id,
                })
                .await;
            registry
                .set_state(&conversation_id, &participant_id, ConnectionState::Open)
                .await;
        }
        Err(e) => {
            warn!(
                conversation = %conversation_id,
                participant = %participant_id,
                "Join rejected: {}", e
            );
            if let Some(code) = e.wire_code() {
                let _ = tx
                    .send(ServerFrame::Error {
                        code,
                        message: e.to_string(),
                        retry_after: e.retry_after_secs(),
                    })
                    .await;
            }
            registry
                .unregister(&conversation_id, &participant_id, connection_id)
                .await;
            // Drain what's queued, then drop the socket. All senders
            // are gone once the registry entry and our clone are
            // dropped, so the loop terminates.
            drop(tx);
            while let Some(frame) = rx.recv().await {
                send_frame(&mut ws_sender, &frame).await;
            }
            let _ = ws_sender.close().await;
            metrics.connection_closed();
            return;
        }
    }

    // Task to drain outbound frames and emit heartbeat pings.
    let heartbeat = config.heartbeat_interval;
    let sender_task = async move {
        let mut ping = tokio::time::interval(heartbeat);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping.tick().await; // first tick is immediate
        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        let json = match serde_json::to_string(&frame) {
                            Ok(j) => j,
                            Err(e) => {
                                warn!("Failed to serialize frame: {}", e);
                                continue;
                            }
                        };
                        if ws_sender.send(WsMessage::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    if ws_sender.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    };

    // Task to handle incoming frames.
    let handle_input = handle.clone();
    let registry_input = registry.clone();
    let conversation_input = conversation_id.clone();
    let participant_input = participant_id.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => {
                    registry_input
                        .mark_seen(&conversation_input, &participant_input)
                        .await;
                    let frame = match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!(
                                participant = %participant_input,
                                "Ignoring malformed frame: {}", e
                            );
                            continue;
                        }
                    };
                    match frame {
                        ClientFrame::Message {
                            content,
                            client_message_id,
                        } => {
                            let result = handle_input
                                .submit(
                                    participant_input.clone(),
                                    content,
                                    client_message_id.clone(),
                                )
                                .await;
                            let reply = match result {
                                Ok(sequence_id) => ServerFrame::Ack {
                                    client_message_id,
                                    sequence_id,
                                },
                                Err(e) => match e.wire_code() {
                                    Some(code) => ServerFrame::Error {
                                        code,
                                        message: e.to_string(),
                                        retry_after: e.retry_after_secs(),
                                    },
                                    None => {
                                        warn!(
                                            conversation = %conversation_input,
                                            "Submit failed: {}", e
                                        );
                                        continue;
                                    }
                                },
                            };
                            let sent = registry_input
                                .send_to(&conversation_input, &participant_input, reply)
                                .await;
                            if !sent {
                                break;
                            }
                        }
                        ClientFrame::Typing { is_typing } => {
                            handle_input
                                .typing(participant_input.clone(), is_typing)
                                .await;
                        }
                        ClientFrame::Sync { last_sequence_id } => {
                            // Syncing connections are skipped by live
                            // broadcast until the actor's reply flips
                            // them back to Open, so the replayed range
                            // is delivered exactly once and in order.
                            registry_input
                                .set_state(
                                    &conversation_input,
                                    &participant_input,
                                    ConnectionState::Syncing,
                                )
                                .await;
                            handle_input
                                .sync(participant_input.clone(), last_sequence_id)
                                .await;
                        }
                    }
                }
                Ok(WsMessage::Pong(_)) => {
                    registry_input
                        .mark_seen(&conversation_input, &participant_input)
                        .await;
                }
                Ok(WsMessage::Close(_)) => {
                    debug!(participant = %participant_input, "Client closed connection");
                    break;
                }
                Err(e) => {
                    debug!(participant = %participant_input, "WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!("Sender task ended"),
        _ = input_task => debug!("Input task ended"),
        _ = cancel.cancelled() => debug!("Connection cancelled (superseded or reaped)"),
    }

    // Only the current registration marks the participant offline; a
    // superseded socket must not kick out its replacement.
    let was_current = registry
        .unregister(&conversation_id, &participant_id, connection_id)
        .await;
    if was_current {
        handle.leave(participant_id.clone()).await;
    }

    metrics.connection_closed();
    info!(
        conversation = %conversation_id,
        participant = %participant_id,
        was_current,
        "WebSocket connection closed"
    );
}

async fn send_frame(
    ws_sender: &mut (impl SinkExt<WsMessage> + Unpin),
    frame: &ServerFrame,
) {
    if let Ok(json) = serde_json::to_string(frame) {
        let _ = ws_sender.send(WsMessage::Text(json.into())).await;
    }
}
