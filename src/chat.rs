//! Ephemeral, session-scoped chat.
//!
//! Messages live in a local buffer for the lifetime of the subscription
//! and are never persisted. The transport echoes broadcasts back to the
//! sender, so the sender appends locally at compose time (no round-trip
//! wait) and de-duplicates the echo by message id — never by arrival
//! order. Inbound ordering is per-connection FIFO only; no attempt is
//! made to order across participants' independent streams.
//!
//! System messages ("Bob joined") are synthesized locally from presence
//! deltas, one per delta, and never transmitted — two clients may show
//! slightly different system logs if one missed a transient join, which
//! is fine: this is a convenience log, not a record of truth.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatKind {
    User,
    System,
}

/// One chat entry. `id` is client-generated and is the dedup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub body: String,
    /// Epoch millis at the sender. Display only — never used for ordering,
    /// since clocks may skew.
    pub sent_at: u64,
    pub kind: ChatKind,
}

/// Local message buffer for one document session.
pub struct ChatStream {
    messages: Vec<ChatMessage>,
    /// Ids already appended, so the transport's self-echo (and any
    /// at-least-once redelivery) is a no-op.
    seen: HashSet<Uuid>,
}

impl ChatStream {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Build a user message and append it locally, returning the message
    /// for broadcast. The local append happens immediately; the echo from
    /// the channel is dropped by id.
    pub fn compose(
        &mut self,
        sender_id: Uuid,
        display_name: &str,
        avatar_ref: Option<String>,
        body: &str,
        sent_at: u64,
    ) -> ChatMessage {
        let message = ChatMessage {
            id: Uuid::new_v4(),
            sender_id,
            display_name: display_name.to_string(),
            avatar_ref,
            body: body.to_string(),
            sent_at,
            kind: ChatKind::User,
        };
        self.seen.insert(message.id);
        self.messages.push(message.clone());
        message
    }

    /// Append an inbound message in arrival order. Returns false if the
    /// id was already seen (self-echo or redelivery).
    pub fn apply_inbound(&mut self, message: ChatMessage) -> bool {
        if !self.seen.insert(message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Synthesize the local system message for a join delta.
    pub fn system_joined(&mut self, display_name: &str, at: u64) {
        self.push_system(format!("{display_name} joined the document"), at);
    }

    /// Synthesize the local system message for a leave delta.
    pub fn system_left(&mut self, display_name: &str, at: u64) {
        self.push_system(format!("{display_name} left the document"), at);
    }

    fn push_system(&mut self, body: String, at: u64) {
        let message = ChatMessage {
            id: Uuid::new_v4(),
            sender_id: Uuid::nil(),
            display_name: String::new(),
            avatar_ref: None,
            body,
            sent_at: at,
            kind: ChatKind::System,
        };
        self.seen.insert(message.id);
        self.messages.push(message);
    }

    /// Empty the local buffer. No network effect. Seen ids are kept so a
    /// late echo of a pre-clear message does not reappear.
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl Default for ChatStream {
    fn default() -> Self {
        Self::new()
    }
}
