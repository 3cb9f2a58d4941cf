//! Durable, anchored comment threads, mirrored live via a change feed.
//!
//! ```text
//! create()/resolve()/reply()
//!       │
//!       ▼
//! CommentPersistence (external collaborator)
//!       │  row-level change feed
//!       ▼
//! CommentThreadEngine::apply_change()   ◄── every client, creator included
//!       │
//!       ▼
//! local comment list + CommentAdded notifications
//! ```
//!
//! Writes never mutate local state directly: the feed is the single
//! "comment appeared" code path, so the creating client and everyone
//! else converge through the same logic. Because writes are not applied
//! optimistically, a persistence failure needs no rollback — it is just
//! surfaced to the initiating user.
//!
//! Anchors are immutable after creation and `resolved` is monotonic in
//! normal flow; anchors are soft hints, not reflow-aware positions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::directory::ProfileCache;
use crate::error::CollabError;
use crate::notify::Notification;

/// Text-range reference a comment is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub range_start: usize,
    pub range_end: usize,
    pub quoted_text: String,
}

impl Anchor {
    /// A collapsed range carries no selection and cannot anchor a comment.
    pub fn is_collapsed(&self) -> bool {
        self.range_end <= self.range_start
    }
}

/// One reply under a comment, ordered by append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentReply {
    pub id: Uuid,
    pub author_id: Uuid,
    pub body: String,
    pub created_at: u64,
}

/// One anchored comment thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub document_id: Uuid,
    pub author_id: Uuid,
    pub body: String,
    pub anchor: Anchor,
    pub resolved: bool,
    pub created_at: u64,
    pub replies: Vec<CommentReply>,
}

/// Row-level change-feed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommentChange {
    Inserted(Comment),
    Updated(Comment),
    Deleted(Uuid),
}

/// Persistence collaborator boundary. The platform owns the rows; this
/// core only mirrors them.
pub trait CommentPersistence: Send + Sync {
    /// All comments for a document, any order; the engine sorts by
    /// `created_at` ascending.
    fn list(&self, document_id: Uuid) -> Result<Vec<Comment>, CollabError>;
    fn insert(&self, comment: Comment) -> Result<(), CollabError>;
    fn set_resolved(&self, comment_id: Uuid, resolved: bool) -> Result<(), CollabError>;
    fn append_reply(&self, comment_id: Uuid, reply: CommentReply) -> Result<(), CollabError>;
    fn remove(&self, comment_id: Uuid) -> Result<(), CollabError>;
    /// Subscribe to the change feed for one document.
    fn subscribe(&self, document_id: Uuid) -> broadcast::Receiver<CommentChange>;
}

/// Local mirror of the comment graph for one document.
pub struct CommentThreadEngine {
    document_id: Uuid,
    local_participant: Uuid,
    store: Arc<dyn CommentPersistence>,
    /// Ordered by `created_at` ascending.
    comments: Vec<Comment>,
    profiles: ProfileCache,
}

impl CommentThreadEngine {
    pub fn new(
        document_id: Uuid,
        local_participant: Uuid,
        store: Arc<dyn CommentPersistence>,
        profiles: ProfileCache,
    ) -> Self {
        Self {
            document_id,
            local_participant,
            store,
            comments: Vec::new(),
            profiles,
        }
    }

    /// Load the authoritative seed state. Returns the number of comments.
    pub fn seed(&mut self) -> Result<usize, CollabError> {
        let mut comments = self.store.list(self.document_id)?;
        comments.sort_by_key(|c| c.created_at);
        let n = comments.len();
        self.comments = comments;
        Ok(n)
    }

    /// Persist a new comment anchored to the current selection. Local
    /// state is untouched; the change feed reflects the insert everywhere,
    /// including here.
    pub fn create(
        &mut self,
        anchor: Anchor,
        body: &str,
        created_at: u64,
    ) -> Result<Uuid, CollabError> {
        if anchor.is_collapsed() {
            return Err(CollabError::EmptyAnchor);
        }
        if body.trim().is_empty() {
            return Err(CollabError::EmptyBody);
        }
        let comment = Comment {
            id: Uuid::new_v4(),
            document_id: self.document_id,
            author_id: self.local_participant,
            body: body.to_string(),
            anchor,
            resolved: false,
            created_at,
            replies: Vec::new(),
        };
        let id = comment.id;
        self.store.insert(comment)?;
        Ok(id)
    }

    /// One-way resolve. Resolving an already-resolved comment is an
    /// idempotent no-op: no persistence call, no second feed event.
    pub fn resolve(&mut self, comment_id: Uuid) -> Result<(), CollabError> {
        match self.comments.iter().find(|c| c.id == comment_id) {
            Some(c) if c.resolved => Ok(()),
            Some(_) => self.store.set_resolved(comment_id, true),
            None => Err(CollabError::PersistenceFailure(format!(
                "unknown comment {comment_id}"
            ))),
        }
    }

    /// Append a reply. Replying to a resolved thread is allowed.
    pub fn reply(
        &mut self,
        comment_id: Uuid,
        body: &str,
        created_at: u64,
    ) -> Result<Uuid, CollabError> {
        if body.trim().is_empty() {
            return Err(CollabError::EmptyBody);
        }
        if !self.comments.iter().any(|c| c.id == comment_id) {
            return Err(CollabError::PersistenceFailure(format!(
                "unknown comment {comment_id}"
            )));
        }
        let reply = CommentReply {
            id: Uuid::new_v4(),
            author_id: self.local_participant,
            body: body.to_string(),
            created_at,
        };
        let id = reply.id;
        self.store.append_reply(comment_id, reply)?;
        Ok(id)
    }

    /// Apply one change-feed event.
    pub fn apply_change(&mut self, change: CommentChange) -> Vec<Notification> {
        match change {
            CommentChange::Inserted(comment) => {
                if comment.document_id != self.document_id {
                    return Vec::new();
                }
                if self.comments.iter().any(|c| c.id == comment.id) {
                    // At-least-once redelivery: keyed by id, safe to drop.
                    return Vec::new();
                }
                let mut notes = Vec::new();
                if comment.author_id != self.local_participant {
                    let author = self.profiles.resolve(comment.author_id);
                    notes.push(Notification::CommentAdded {
                        comment_id: comment.id,
                        author_id: comment.author_id,
                        author_name: author.display_name,
                    });
                }
                // Keep created_at ascending without resorting the list.
                let at = self
                    .comments
                    .iter()
                    .position(|c| c.created_at > comment.created_at)
                    .unwrap_or(self.comments.len());
                self.comments.insert(at, comment);
                notes
            }
            CommentChange::Updated(comment) => {
                match self.comments.iter_mut().find(|c| c.id == comment.id) {
                    Some(slot) => *slot = comment,
                    None => {
                        // Feed contract is insert-before-update; anything
                        // else cannot be applied meaningfully.
                        log::warn!(
                            "dropping comment update before insert for {}",
                            comment.id
                        );
                    }
                }
                Vec::new()
            }
            CommentChange::Deleted(comment_id) => {
                self.comments.retain(|c| c.id != comment_id);
                Vec::new()
            }
        }
    }

    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    pub fn get(&self, comment_id: Uuid) -> Option<&Comment> {
        self.comments.iter().find(|c| c.id == comment_id)
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory reference persistence
// ───────────────────────────────────────────────────────────────────

/// Reference [`CommentPersistence`] with a broadcast change feed. Used by
/// tests and by local/offline sessions.
pub struct InMemoryCommentStore {
    rows: Mutex<HashMap<Uuid, Vec<Comment>>>,
    feeds: Mutex<HashMap<Uuid, broadcast::Sender<CommentChange>>>,
    fail_writes: AtomicBool,
}

impl InMemoryCommentStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            feeds: Mutex::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every write fail, for exercising `PersistenceFailure` paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), CollabError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(CollabError::PersistenceFailure("write rejected".into()))
        } else {
            Ok(())
        }
    }

    fn feed(&self, document_id: Uuid) -> broadcast::Sender<CommentChange> {
        let mut feeds = self.feeds.lock().expect("feed lock poisoned");
        feeds
            .entry(document_id)
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }

    fn emit(&self, document_id: Uuid, change: CommentChange) {
        // No subscribers is fine; send() only errors when empty.
        let _ = self.feed(document_id).send(change);
    }

    /// Locate and mutate a comment under one lock acquisition, so a
    /// concurrent remove() cannot slip between lookup and mutation.
    /// Returns the document id and the mutated row for the feed.
    fn mutate(
        &self,
        comment_id: Uuid,
        apply: impl FnOnce(&mut Comment),
    ) -> Result<(Uuid, Comment), CollabError> {
        let mut rows = self.rows.lock().expect("row lock poisoned");
        match rows.iter_mut().find_map(|(doc, comments)| {
            comments
                .iter_mut()
                .find(|c| c.id == comment_id)
                .map(|c| (*doc, c))
        }) {
            Some((document_id, comment)) => {
                apply(comment);
                Ok((document_id, comment.clone()))
            }
            None => Err(CollabError::PersistenceFailure(format!(
                "unknown comment {comment_id}"
            ))),
        }
    }
}

impl Default for InMemoryCommentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CommentPersistence for InMemoryCommentStore {
    fn list(&self, document_id: Uuid) -> Result<Vec<Comment>, CollabError> {
        let rows = self.rows.lock().expect("row lock poisoned");
        Ok(rows.get(&document_id).cloned().unwrap_or_default())
    }

    fn insert(&self, comment: Comment) -> Result<(), CollabError> {
        self.check_writable()?;
        let document_id = comment.document_id;
        {
            let mut rows = self.rows.lock().expect("row lock poisoned");
            rows.entry(document_id).or_default().push(comment.clone());
        }
        self.emit(document_id, CommentChange::Inserted(comment));
        Ok(())
    }

    fn set_resolved(&self, comment_id: Uuid, resolved: bool) -> Result<(), CollabError> {
        self.check_writable()?;
        let (document_id, updated) = self.mutate(comment_id, |c| c.resolved = resolved)?;
        self.emit(document_id, CommentChange::Updated(updated));
        Ok(())
    }

    fn append_reply(&self, comment_id: Uuid, reply: CommentReply) -> Result<(), CollabError> {
        self.check_writable()?;
        let (document_id, updated) = self.mutate(comment_id, |c| c.replies.push(reply))?;
        self.emit(document_id, CommentChange::Updated(updated));
        Ok(())
    }

    fn remove(&self, comment_id: Uuid) -> Result<(), CollabError> {
        self.check_writable()?;
        let document_id = {
            let mut rows = self.rows.lock().expect("row lock poisoned");
            match rows
                .iter_mut()
                .find(|(_, comments)| comments.iter().any(|c| c.id == comment_id))
            {
                Some((document_id, comments)) => {
                    comments.retain(|c| c.id != comment_id);
                    *document_id
                }
                None => {
                    return Err(CollabError::PersistenceFailure(format!(
                        "unknown comment {comment_id}"
                    )))
                }
            }
        };
        self.emit(document_id, CommentChange::Deleted(comment_id));
        Ok(())
    }

    fn subscribe(&self, document_id: Uuid) -> broadcast::Receiver<CommentChange> {
        self.feed(document_id).subscribe()
    }
}
