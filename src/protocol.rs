//! Tagged wire events for the per-document broadcast channel.
//!
//! Every inbound payload is decoded exactly once, at the subscription
//! boundary, into a closed [`ChannelEvent`] variant — internal logic never
//! handles untyped data. Frames are bincode-encoded:
//!
//! ```text
//! ┌──────────┬──────────┬──────────────────────────┐
//! │ sender   │ purpose  │ event (tagged variant)    │
//! │ 16 bytes │ 1 byte   │ variable                  │
//! └──────────┴──────────┴──────────────────────────┘
//! ```
//!
//! A frame that fails to decode is a [`CollabError::MalformedEvent`]; the
//! subscription drops it and logs, the reconciliation loop never sees it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chat::ChatMessage;
use crate::comments::Comment;
use crate::error::CollabError;
use crate::presence::PresenceState;

/// Channel purpose. One logical subscription exists per
/// (document, purpose) per client process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Purpose {
    Presence,
    Chat,
    CommentFeed,
}

impl Purpose {
    /// The channel name this purpose subscribes to for a document.
    pub fn channel_name(&self, document_id: Uuid) -> String {
        let suffix = match self {
            Purpose::Presence => "presence",
            Purpose::Chat => "chat",
            Purpose::CommentFeed => "comments",
        };
        format!("doc:{document_id}:{suffix}")
    }
}

/// One event kind per wire message. Closed set: anything else on the
/// channel is malformed by definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChannelEvent {
    /// Full, authoritative replacement of the presence set. `seq` is
    /// stamped monotonically per channel by the transport so a stale
    /// snapshot arriving late cannot roll back a fresher one.
    PresenceSync {
        seq: u64,
        participants: Vec<PresenceState>,
    },
    /// A participant started being tracked on the channel.
    PresenceJoin { state: PresenceState },
    /// A participant stopped being tracked (left or disconnected).
    PresenceLeave { participant_id: Uuid },
    /// Ephemeral chat message, user-authored. System messages are
    /// synthesized locally and never transmitted.
    Chat { message: ChatMessage },
    /// Change-feed mirror events for durable comments.
    CommentInsert { comment: Comment },
    CommentUpdate { comment: Comment },
    CommentDelete { comment_id: Uuid },
}

impl ChannelEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelEvent::PresenceSync { .. } => "presence-sync",
            ChannelEvent::PresenceJoin { .. } => "presence-join",
            ChannelEvent::PresenceLeave { .. } => "presence-leave",
            ChannelEvent::Chat { .. } => "chat-message",
            ChannelEvent::CommentInsert { .. } => "comment-insert",
            ChannelEvent::CommentUpdate { .. } => "comment-update",
            ChannelEvent::CommentDelete { .. } => "comment-delete",
        }
    }
}

/// Envelope for a single broadcast on a channel.
///
/// `sender` identifies the originating participant so subscriptions
/// opened with `echo_self = false` can drop their own reflections.
/// Transport-synthesized frames (presence sync) use a nil sender and are
/// delivered to everyone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub sender: Uuid,
    pub purpose: Purpose,
    pub event: ChannelEvent,
}

impl Frame {
    pub fn new(sender: Uuid, purpose: Purpose, event: ChannelEvent) -> Self {
        Self {
            sender,
            purpose,
            event,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, CollabError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CollabError::MalformedEvent(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, CollabError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CollabError::MalformedEvent(e.to_string()))?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatKind;
    use crate::comments::Anchor;

    #[test]
    fn test_frame_roundtrip_presence_join() {
        let id = Uuid::new_v4();
        let state = PresenceState {
            participant_id: id,
            online_since: 1_700_000_000_000,
            cursor: None,
            is_editing: false,
            has_focus: true,
        };
        let frame = Frame::new(
            id,
            Purpose::Presence,
            ChannelEvent::PresenceJoin { state },
        );

        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(frame, decoded);
        assert_eq!(decoded.event.kind(), "presence-join");
    }

    #[test]
    fn test_frame_roundtrip_chat() {
        let sender = Uuid::new_v4();
        let message = ChatMessage {
            id: Uuid::new_v4(),
            sender_id: sender,
            display_name: "Alice".into(),
            avatar_ref: Some("avatars/alice.png".into()),
            body: "hello".into(),
            sent_at: 42,
            kind: ChatKind::User,
        };
        let frame = Frame::new(sender, Purpose::Chat, ChannelEvent::Chat { message });

        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_frame_roundtrip_comment_insert() {
        let author = Uuid::new_v4();
        let comment = Comment {
            id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            author_id: author,
            body: "check this".into(),
            anchor: Anchor {
                range_start: 10,
                range_end: 25,
                quoted_text: "example".into(),
            },
            resolved: false,
            created_at: 7,
            replies: Vec::new(),
        };
        let frame = Frame::new(
            author,
            Purpose::CommentFeed,
            ChannelEvent::CommentInsert { comment: comment.clone() },
        );

        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        match decoded.event {
            ChannelEvent::CommentInsert { comment: c } => assert_eq!(c, comment),
            other => panic!("expected comment-insert, got {}", other.kind()),
        }
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        match Frame::decode(&garbage) {
            Err(CollabError::MalformedEvent(_)) => {}
            other => panic!("expected MalformedEvent, got {other:?}"),
        }
    }

    #[test]
    fn test_channel_names_are_purpose_scoped() {
        let doc = Uuid::new_v4();
        let presence = Purpose::Presence.channel_name(doc);
        let chat = Purpose::Chat.channel_name(doc);
        let feed = Purpose::CommentFeed.channel_name(doc);

        assert!(presence.ends_with(":presence"));
        assert!(chat.ends_with(":chat"));
        assert!(feed.ends_with(":comments"));
        assert_ne!(presence, chat);
        assert_ne!(chat, feed);
    }

    #[test]
    fn test_cursor_frame_size_efficient() {
        // Cursor re-announcements ride on presence tracking; the join
        // frame is the largest presence frame and should stay compact.
        let state = PresenceState {
            participant_id: Uuid::new_v4(),
            online_since: 1_700_000_000_000,
            cursor: Some(crate::presence::CursorPosition {
                anchor_start: 120,
                anchor_end: 140,
                screen: Some((640.0, 480.0)),
            }),
            is_editing: true,
            has_focus: true,
        };
        let frame = Frame::new(
            state.participant_id,
            Purpose::Presence,
            ChannelEvent::PresenceJoin { state },
        );
        let encoded = frame.encode().unwrap();
        assert!(encoded.len() < 80, "join frame too large: {} bytes", encoded.len());
    }
}
