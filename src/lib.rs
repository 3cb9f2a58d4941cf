//! # scribe-collab — Real-time collaboration layer for Scribe documents
//!
//! Synchronizes the ephemeral collaboration surface of a shared document:
//! who is present, where their cursors are, session chat, and durable
//! anchored comment threads. Document content itself is out of scope;
//! this crate never blocks editing.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   named channels   ┌──────────────────┐
//! │ DocumentSession  │ ◄─────────────────► │ ChannelTransport │
//! │ (per user)       │   binary frames     │ (platform)       │
//! └────────┬─────────┘                     └──────────────────┘
//!          │ dispatch (single sequence)
//!    ┌─────┼──────────────┬────────────────┐
//!    ▼     ▼              ▼                ▼
//! ┌──────────┐ ┌────────────┐ ┌───────────────────┐
//! │ Presence │ │ ChatStream │ │ CommentThread     │◄── change feed
//! │ Store    │ │            │ │ Engine            │    (persistence)
//! └────┬─────┘ └────────────┘ └───────────────────┘
//!      │
//!      ▼
//! ┌──────────────────┐
//! │ CursorProjector  │ ──► overlay sprites for the renderer
//! └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Tagged binary wire events (bincode-encoded [`Frame`])
//! - [`transport`] — Channel transport boundary + in-process reference
//! - [`subscription`] — Explicit open/sync/close lifecycle state machine
//! - [`presence`] — Per-document participant reconciliation
//! - [`chat`] — Ephemeral session chat with echo de-duplication
//! - [`comments`] — Durable anchored threads mirrored via a change feed
//! - [`projector`] — Pure presence-to-overlay cursor projection
//! - [`directory`] — Profile lookup boundary with per-session cache
//! - [`session`] — Per-document wiring, dispatch, epoch-based teardown
//!
//! ## Guarantees
//!
//! - At most one authoritative presence record per (document, participant)
//! - Join/leave/editing notifications fire exactly once per transition
//! - Comments appear only through the change feed, creator included
//! - Teardown is total: no event from a closed subscription mutates state

pub mod chat;
pub mod comments;
pub mod directory;
pub mod error;
pub mod notify;
pub mod presence;
pub mod projector;
pub mod protocol;
pub mod session;
pub mod subscription;
pub mod transport;

// Re-exports for convenience
pub use chat::{ChatKind, ChatMessage, ChatStream};
pub use comments::{
    Anchor, Comment, CommentChange, CommentPersistence, CommentReply,
    CommentThreadEngine, InMemoryCommentStore,
};
pub use directory::{Profile, ProfileCache, ProfileDirectory, StaticDirectory};
pub use error::CollabError;
pub use notify::Notification;
pub use presence::{CursorPosition, PresenceRecord, PresenceState, PresenceStore};
pub use projector::{
    approximate_anchor_y, comment_card_offsets, project_cursors, CursorSprite,
    DocumentSurface, Rect, SurfaceMetrics,
};
pub use protocol::{ChannelEvent, Frame, Purpose};
pub use session::DocumentSession;
pub use subscription::{SubscriptionInput, SubscriptionPhase, SubscriptionState};
pub use transport::{ChannelConfig, ChannelHandle, ChannelTransport, InProcessTransport};

/// Milliseconds since the Unix epoch. Clock skew between participants is
/// tolerated everywhere timestamps are used (display and coarse ordering
/// only), so a best-effort reading is fine.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
