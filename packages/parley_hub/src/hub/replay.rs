//! Bounded ring buffer for reconnection replay.
//!
//! Each conversation keeps its recent broadcast messages in memory so
//! a rejoining connection can be caught up from a given sequence id
//! without touching storage. When the buffer no longer covers the
//! requested range, the caller falls back to `Storage::load_range`.

use std::collections::VecDeque;

use parley_protocol::Message;

/// Result of a replay attempt.
pub enum Replay {
    /// The buffer fully covers `(last_seq, head]`.
    Complete(Vec<Message>),
    /// `last_seq` predates the oldest buffered entry; the caller must
    /// consult storage (or accept the partial tail).
    Partial(Vec<Message>),
}

/// Seq-keyed ring buffer of recent messages.
pub struct ReplayBuffer {
    buffer: VecDeque<Message>,
    max_entries: usize,
}

impl ReplayBuffer {
    pub fn new(max_entries: usize) -> Self {
        Self {
            buffer: VecDeque::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Push a broadcast message. Messages arrive in sequence order
    /// because the conversation actor serializes broadcast.
    pub fn push(&mut self, message: Message) {
        while self.buffer.len() >= self.max_entries {
            self.buffer.pop_front();
        }
        self.buffer.push_back(message);
    }

    /// All buffered messages with `sequence_id > last_seq`, ascending.
    pub fn replay_since(&self, last_seq: u64) -> Replay {
        let messages: Vec<Message> = self
            .buffer
            .iter()
            .filter(|m| m.sequence_id > last_seq)
            .cloned()
            .collect();

        let oldest = self.buffer.front().map(|m| m.sequence_id).unwrap_or(0);
        // Covered when the client is at or past the entry just before
        // our oldest buffered message (or the buffer holds everything
        // ever sequenced, oldest == 1).
        let covered = self.buffer.is_empty() && last_seq == 0
            || !self.buffer.is_empty() && (last_seq + 1 >= oldest || oldest == 1);

        if covered {
            Replay::Complete(messages)
        } else {
            Replay::Partial(messages)
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The highest buffered sequence id, or 0 if empty.
    pub fn head_seq(&self) -> u64 {
        self.buffer.back().map(|m| m.sequence_id).unwrap_or(0)
    }
}
