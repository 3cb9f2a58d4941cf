//! Per-document session: wiring, dispatch, teardown.
//!
//! ```text
//! ChannelHandle (presence) ──┐
//! ChannelHandle (chat) ──────┤  decode at boundary,   ┌──────────────┐
//!                            ├──(epoch, purpose, ev)──►  dispatch()   │
//! CommentPersistence feed ───┘        mpsc            │  single seq   │
//!                                                     └──────┬───────┘
//!                                    PresenceStore ◄─────────┤
//!                                    ChatStream     ◄────────┤
//!                                    CommentThreadEngine ◄───┘
//! ```
//!
//! All state mutation happens on one logical event-processing sequence:
//! inbound frames are decoded once in forwarding tasks and funneled into
//! a single queue that [`DocumentSession::dispatch`] drains. No locks
//! guard the core stores; rapid local mutations serialize naturally with
//! last-applied-wins.
//!
//! Teardown is epoch-based: closing bumps the session epoch, and every
//! queued event carries the epoch of the subscription that produced it,
//! so an event already in flight when teardown was requested can never
//! mutate state. Switching documents is close-then-open, sequential,
//! never concurrent — no cross-document leakage.

use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::chat::ChatStream;
use crate::comments::{
    Anchor, CommentChange, CommentPersistence, CommentThreadEngine,
};
use crate::directory::{Profile, ProfileCache, ProfileDirectory};
use crate::error::CollabError;
use crate::notify::Notification;
use crate::presence::{CursorPosition, PresenceStore};
use crate::projector::{self, CursorSprite, DocumentSurface, Rect, SurfaceMetrics};
use crate::protocol::{ChannelEvent, Frame, Purpose};
use crate::subscription::{SubscriptionInput, SubscriptionPhase, SubscriptionState};
use crate::transport::{ChannelConfig, ChannelHandle, ChannelTransport};

/// One decoded event, tagged with the epoch of its subscription.
#[derive(Debug)]
struct InboundEvent {
    epoch: u64,
    purpose: Purpose,
    event: ChannelEvent,
}

/// Per-document state, built on open and discarded on close.
struct ActiveDocument {
    document_id: Uuid,
    presence: PresenceStore,
    chat: ChatStream,
    comments: CommentThreadEngine,
    presence_sub: SubscriptionState,
    chat_sub: SubscriptionState,
    feed_sub: SubscriptionState,
    presence_handle: Option<Box<dyn ChannelHandle>>,
    chat_handle: Option<Box<dyn ChannelHandle>>,
    degraded: bool,
}

/// The collaboration session for the local participant.
///
/// Collaborators (transport, profile directory, comment persistence) are
/// passed in explicitly so tests can substitute fakes; there is no
/// module-level client singleton.
pub struct DocumentSession {
    transport: Arc<dyn ChannelTransport>,
    directory: Arc<dyn ProfileDirectory>,
    store: Arc<dyn CommentPersistence>,
    local_id: Uuid,
    local_profile: Profile,
    /// Bumped on every close; forwarders stamp events with the epoch
    /// current when their subscription opened.
    epoch: u64,
    active: Option<ActiveDocument>,
    event_tx: mpsc::UnboundedSender<InboundEvent>,
    event_rx: mpsc::UnboundedReceiver<InboundEvent>,
    notify_tx: mpsc::UnboundedSender<Notification>,
    notify_rx: Option<mpsc::UnboundedReceiver<Notification>>,
}

impl DocumentSession {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        directory: Arc<dyn ProfileDirectory>,
        store: Arc<dyn CommentPersistence>,
        local_id: Uuid,
    ) -> Self {
        let local_profile = directory.lookup(local_id).unwrap_or_else(|e| {
            log::debug!("local profile lookup failed ({e}), using anonymous");
            Profile::anonymous()
        });
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            directory,
            store,
            local_id,
            local_profile,
            epoch: 0,
            active: None,
            event_tx,
            event_rx,
            notify_tx,
            notify_rx: Some(notify_rx),
        }
    }

    /// Take the notification receiver (once) for the presentation layer.
    pub fn take_notification_rx(&mut self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.notify_rx.take()
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    pub fn document_id(&self) -> Option<Uuid> {
        self.active.as_ref().map(|a| a.document_id)
    }

    /// Whether the session is running without a transport (local-only).
    pub fn is_degraded(&self) -> bool {
        self.active.as_ref().map(|a| a.degraded).unwrap_or(false)
    }

    // ── lifecycle ────────────────────────────────────────────────

    /// Open subscriptions for a document and announce local presence.
    ///
    /// Must be called inside a tokio runtime (forwarding tasks are
    /// spawned). A transport that cannot open channels degrades the
    /// session to local-only instead of failing: presence and chat are
    /// conveniences and never block editing. Comment seeding failures are
    /// the only fatal ones — comments are durable data.
    pub fn open(&mut self, document_id: Uuid) -> Result<(), CollabError> {
        self.close();

        let now = crate::now_millis();
        let mut degraded = false;

        let presence = PresenceStore::new(
            document_id,
            self.local_id,
            self.local_profile.clone(),
            now,
            ProfileCache::new(self.directory.clone()),
        );
        let chat = ChatStream::new();
        let comments = CommentThreadEngine::new(
            document_id,
            self.local_id,
            self.store.clone(),
            ProfileCache::new(self.directory.clone()),
        );

        let mut presence_sub = SubscriptionState::new(Purpose::Presence);
        let mut chat_sub = SubscriptionState::new(Purpose::Chat);
        let mut feed_sub = SubscriptionState::new(Purpose::CommentFeed);

        // Presence channel.
        presence_sub.apply(SubscriptionInput::OpenRequested)?;
        let presence_handle = match self.transport.open(
            &Purpose::Presence.channel_name(document_id),
            ChannelConfig {
                echo_self: false,
                presence_key: Some(self.local_id),
            },
        ) {
            Ok(handle) => {
                self.spawn_channel_forwarder(handle.as_ref(), Purpose::Presence);
                presence_sub.apply(SubscriptionInput::OpenConfirmed)?;
                Some(handle)
            }
            Err(CollabError::ChannelUnavailable) => {
                log::info!("presence channel unavailable for {document_id}, working offline");
                presence_sub.apply(SubscriptionInput::CloseRequested)?;
                presence_sub.apply(SubscriptionInput::CloseConfirmed)?;
                degraded = true;
                None
            }
            Err(e) => return Err(e),
        };

        // Chat channel. The transport echoes chat to the sender; the
        // stream de-duplicates by message id.
        chat_sub.apply(SubscriptionInput::OpenRequested)?;
        let chat_handle = match self.transport.open(
            &Purpose::Chat.channel_name(document_id),
            ChannelConfig {
                echo_self: true,
                presence_key: None,
            },
        ) {
            Ok(handle) => {
                self.spawn_channel_forwarder(handle.as_ref(), Purpose::Chat);
                chat_sub.apply(SubscriptionInput::OpenConfirmed)?;
                chat_sub.apply(SubscriptionInput::SnapshotApplied)?;
                Some(handle)
            }
            Err(CollabError::ChannelUnavailable) => {
                chat_sub.apply(SubscriptionInput::CloseRequested)?;
                chat_sub.apply(SubscriptionInput::CloseConfirmed)?;
                None
            }
            Err(e) => return Err(e),
        };

        // Comment change feed comes from the persistence collaborator,
        // not the channel transport, so it works even degraded.
        feed_sub.apply(SubscriptionInput::OpenRequested)?;
        self.spawn_feed_forwarder(self.store.subscribe(document_id));
        feed_sub.apply(SubscriptionInput::OpenConfirmed)?;

        let mut active = ActiveDocument {
            document_id,
            presence,
            chat,
            comments,
            presence_sub,
            chat_sub,
            feed_sub,
            presence_handle,
            chat_handle,
            degraded,
        };

        // Authoritative comment seed.
        match active.comments.seed() {
            Ok(n) => {
                log::debug!("seeded {n} comments for {document_id}");
                active.feed_sub.apply(SubscriptionInput::SnapshotApplied)?;
            }
            Err(e) => {
                if let Some(h) = active.presence_handle.take() {
                    h.close();
                }
                if let Some(h) = active.chat_handle.take() {
                    h.close();
                }
                return Err(e);
            }
        }

        // Announce local presence; the transport answers with the first
        // sync snapshot.
        if let Some(handle) = &active.presence_handle {
            let announcement = active.presence.announce();
            if let Err(e) = handle.track_presence(&announcement) {
                log::warn!("presence announce failed: {e}");
            }
        }

        self.active = Some(active);
        if degraded {
            let _ = self.notify_tx.send(Notification::Degraded);
        }
        Ok(())
    }

    /// Scoped release: tear down every subscription for the current
    /// document. Runs on every exit path; idempotent.
    pub fn close(&mut self) {
        // Invalidate every forwarder spawned so far, including ones left
        // behind by an open() that failed partway. Must happen even when
        // no document is active, or those forwarders would share the
        // epoch of the next open's fresh subscriptions.
        self.epoch += 1;
        let Some(mut active) = self.active.take() else {
            return;
        };
        log::debug!("closing session for {}", active.document_id);

        // Request teardown first: from here on no event may mutate state.
        for sub in [
            &mut active.presence_sub,
            &mut active.chat_sub,
            &mut active.feed_sub,
        ] {
            if sub.phase() != SubscriptionPhase::Closed {
                let _ = sub.apply(SubscriptionInput::CloseRequested);
            }
        }
        // Closing the presence handle makes the transport announce our
        // departure to the remaining participants.
        if let Some(handle) = active.presence_handle.take() {
            handle.close();
        }
        if let Some(handle) = active.chat_handle.take() {
            handle.close();
        }
        for sub in [
            &mut active.presence_sub,
            &mut active.chat_sub,
            &mut active.feed_sub,
        ] {
            if sub.phase() == SubscriptionPhase::Closing {
                let _ = sub.apply(SubscriptionInput::CloseConfirmed);
            }
        }
    }

    /// Close the old document, then open the new one. Sequential, so
    /// events can never leak across documents.
    pub fn switch_document(&mut self, document_id: Uuid) -> Result<(), CollabError> {
        self.close();
        self.open(document_id)
    }

    // ── event pump ───────────────────────────────────────────────

    /// Await and dispatch the next inbound event.
    pub async fn pump_one(&mut self) -> bool {
        match self.event_rx.recv().await {
            Some(event) => {
                self.dispatch(event);
                true
            }
            None => false,
        }
    }

    /// Dispatch everything already queued, without waiting.
    pub fn pump_ready(&mut self) -> usize {
        let mut n = 0;
        while let Ok(event) = self.event_rx.try_recv() {
            self.dispatch(event);
            n += 1;
        }
        n
    }

    fn dispatch(&mut self, inbound: InboundEvent) {
        if inbound.epoch != self.epoch {
            log::debug!(
                "dropping {} from torn-down subscription",
                inbound.event.kind()
            );
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let now = crate::now_millis();

        match inbound.purpose {
            Purpose::Presence => {
                if !active.presence_sub.accepts_events() {
                    return;
                }
                let notes = match inbound.event {
                    ChannelEvent::PresenceSync { seq, participants } => {
                        let notes = active.presence.apply_sync(seq, &participants);
                        let _ = active
                            .presence_sub
                            .apply(SubscriptionInput::SnapshotApplied);
                        notes
                    }
                    ChannelEvent::PresenceJoin { state } => active.presence.apply_join(&state),
                    ChannelEvent::PresenceLeave { participant_id } => {
                        active.presence.apply_leave(participant_id)
                    }
                    other => {
                        log::warn!("dropping {} on presence channel", other.kind());
                        return;
                    }
                };
                for note in notes {
                    // Join/leave deltas each synthesize exactly one local
                    // system chat message; it is never transmitted.
                    match &note {
                        Notification::Joined { display_name, .. } => {
                            active.chat.system_joined(display_name, now)
                        }
                        Notification::Left { display_name, .. } => {
                            active.chat.system_left(display_name, now)
                        }
                        _ => {}
                    }
                    let _ = self.notify_tx.send(note);
                }
            }
            Purpose::Chat => {
                if !active.chat_sub.accepts_events() {
                    return;
                }
                match inbound.event {
                    ChannelEvent::Chat { message } => {
                        active.chat.apply_inbound(message);
                    }
                    other => log::warn!("dropping {} on chat channel", other.kind()),
                }
            }
            Purpose::CommentFeed => {
                if !active.feed_sub.accepts_events() {
                    return;
                }
                let change = match inbound.event {
                    ChannelEvent::CommentInsert { comment } => CommentChange::Inserted(comment),
                    ChannelEvent::CommentUpdate { comment } => CommentChange::Updated(comment),
                    ChannelEvent::CommentDelete { comment_id } => {
                        CommentChange::Deleted(comment_id)
                    }
                    other => {
                        log::warn!("dropping {} on comment feed", other.kind());
                        return;
                    }
                };
                for note in active.comments.apply_change(change) {
                    let _ = self.notify_tx.send(note);
                }
            }
        }
    }

    // ── user actions ─────────────────────────────────────────────

    /// Broadcast a chat message and append it locally. Returns the id,
    /// or None if there is no open document or the body is blank. A
    /// closed channel drops the broadcast silently: chat is advisory.
    pub fn send_chat(&mut self, body: &str) -> Option<Uuid> {
        if body.trim().is_empty() {
            return None;
        }
        let active = self.active.as_mut()?;
        let message = active.chat.compose(
            self.local_id,
            &self.local_profile.display_name,
            self.local_profile.avatar_ref.clone(),
            body,
            crate::now_millis(),
        );
        if active.chat_sub.accepts_events() {
            if let Some(handle) = &active.chat_handle {
                let frame = Frame::new(
                    self.local_id,
                    Purpose::Chat,
                    ChannelEvent::Chat {
                        message: message.clone(),
                    },
                );
                if let Err(e) = handle.send(&frame) {
                    log::debug!("chat broadcast dropped: {e}");
                }
            }
        }
        Some(message.id)
    }

    /// Move the local cursor. Re-announces only if the position changed.
    pub fn update_cursor(&mut self, cursor: CursorPosition) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if let Some(state) = active.presence.update_cursor(cursor) {
            Self::track(active, &state);
        }
    }

    /// Flip the local editing flag. Re-announces only on a real flip.
    pub fn set_editing(&mut self, editing: bool) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if let Some(state) = active.presence.set_editing(editing) {
            Self::track(active, &state);
        }
    }

    /// Flip the local focus flag.
    pub fn set_focus(&mut self, focus: bool) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if let Some(state) = active.presence.set_focus(focus) {
            Self::track(active, &state);
        }
    }

    fn track(active: &mut ActiveDocument, state: &crate::presence::PresenceState) {
        if !active.presence_sub.accepts_events() {
            return;
        }
        if let Some(handle) = &active.presence_handle {
            if let Err(e) = handle.track_presence(state) {
                log::debug!("presence re-announce dropped: {e}");
            }
        }
    }

    /// Create a comment anchored to an explicit range. The comment
    /// appears locally only once the change feed reflects it.
    pub fn create_comment(&mut self, anchor: Anchor, body: &str) -> Result<Uuid, CollabError> {
        let active = self.active.as_mut().ok_or(CollabError::ChannelUnavailable)?;
        active.comments.create(anchor, body, crate::now_millis())
    }

    /// Create a comment anchored to the surface's current selection.
    pub fn create_comment_from_selection(
        &mut self,
        surface: &dyn DocumentSurface,
        body: &str,
    ) -> Result<Uuid, CollabError> {
        let anchor = surface.resolve_selection().ok_or(CollabError::EmptyAnchor)?;
        self.create_comment(anchor, body)
    }

    /// One-way resolve; idempotent on an already-resolved comment.
    pub fn resolve_comment(&mut self, comment_id: Uuid) -> Result<(), CollabError> {
        let active = self.active.as_mut().ok_or(CollabError::ChannelUnavailable)?;
        active.comments.resolve(comment_id)
    }

    /// Append a reply to a comment thread.
    pub fn reply_to_comment(&mut self, comment_id: Uuid, body: &str) -> Result<Uuid, CollabError> {
        let active = self.active.as_mut().ok_or(CollabError::ChannelUnavailable)?;
        active.comments.reply(comment_id, body, crate::now_millis())
    }

    // ── views ────────────────────────────────────────────────────

    pub fn presence(&self) -> Option<&PresenceStore> {
        self.active.as_ref().map(|a| &a.presence)
    }

    pub fn chat(&self) -> Option<&ChatStream> {
        self.active.as_ref().map(|a| &a.chat)
    }

    /// Empty the local chat buffer. No network effect.
    pub fn clear_chat(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.chat.clear();
        }
    }

    pub fn comments(&self) -> Option<&CommentThreadEngine> {
        self.active.as_ref().map(|a| &a.comments)
    }

    /// Project remote cursors for the current viewport.
    pub fn cursors(&self, viewport: Rect, metrics: &SurfaceMetrics) -> Vec<CursorSprite> {
        match &self.active {
            Some(active) => {
                projector::project_cursors(active.presence.remote_participants(), viewport, metrics)
            }
            None => Vec::new(),
        }
    }

    // ── forwarding tasks ─────────────────────────────────────────

    fn spawn_channel_forwarder(&self, handle: &dyn ChannelHandle, purpose: Purpose) {
        let mut rx = handle.subscribe();
        let echo_self = handle.config().echo_self;
        let local_id = self.local_id;
        let epoch = self.epoch;
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(bytes) => {
                        let frame = match Frame::decode(&bytes) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("dropping malformed frame on {purpose:?}: {e}");
                                continue;
                            }
                        };
                        if frame.purpose != purpose {
                            log::warn!(
                                "dropping {} frame on {purpose:?} channel",
                                frame.event.kind()
                            );
                            continue;
                        }
                        if !echo_self && frame.sender == local_id {
                            continue;
                        }
                        if tx
                            .send(InboundEvent {
                                epoch,
                                purpose,
                                event: frame.event,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("{purpose:?} subscription lagged, skipped {n} frames");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn spawn_feed_forwarder(&self, mut rx: tokio::sync::broadcast::Receiver<CommentChange>) {
        let epoch = self.epoch;
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => {
                        let event = match change {
                            CommentChange::Inserted(comment) => {
                                ChannelEvent::CommentInsert { comment }
                            }
                            CommentChange::Updated(comment) => {
                                ChannelEvent::CommentUpdate { comment }
                            }
                            CommentChange::Deleted(comment_id) => {
                                ChannelEvent::CommentDelete { comment_id }
                            }
                        };
                        if tx
                            .send(InboundEvent {
                                epoch,
                                purpose: Purpose::CommentFeed,
                                event,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("comment feed lagged, skipped {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        self.close();
    }
}
