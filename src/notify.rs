//! Abstract notification events exposed to the presentation layer.
//!
//! The core emits these when something another participant did deserves
//! the local user's attention; how they are rendered (toast, badge) is
//! the host's business.

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A remote participant appeared on the document.
    Joined {
        participant_id: Uuid,
        display_name: String,
    },
    /// A remote participant left the document.
    Left {
        participant_id: Uuid,
        display_name: String,
    },
    /// A remote participant started editing.
    NowEditing {
        participant_id: Uuid,
        display_name: String,
    },
    /// A comment authored by someone else appeared.
    CommentAdded {
        comment_id: Uuid,
        author_id: Uuid,
        author_name: String,
    },
    /// The transport could not be opened; the session is local-only.
    Degraded,
}
