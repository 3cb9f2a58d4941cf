//! Presence tracking: who is on the document, their cursor, their
//! editing state.
//!
//! ```text
//! Local cursor move / editing toggle
//!       │
//!       ▼
//! PresenceStore::update_cursor() ── unchanged? ──► suppressed (None)
//!       │ changed
//!       ▼
//! PresenceState re-announcement ──► ChannelHandle::track_presence()
//!       │
//!       ▼   (channel broadcast)
//! Remote PresenceStore::apply_sync() / apply_join() / apply_leave()
//!       │
//!       ▼
//! Joined / Left / NowEditing notifications + CursorProjector input
//! ```
//!
//! The store holds the authoritative local view for one document. Sync
//! snapshots replace the remote view wholesale; join/leave deltas adjust
//! it incrementally. Both paths are idempotent per participant id, so
//! at-least-once delivery converges. Presence is a convenience: none of
//! this ever blocks editing.
//!
//! Reference: Kleppmann, Chapter 8 — Broadcast Protocols

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::directory::{Profile, ProfileCache};
use crate::notify::Notification;

/// Text-range cursor with the last known pixel fix, carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub anchor_start: usize,
    pub anchor_end: usize,
    /// Last known pixel position in document-surface coordinates.
    pub screen: Option<(f32, f32)>,
}

/// Wire-side presence record. Profile enrichment (display name, avatar)
/// happens locally against the directory cache, so the channel only
/// carries ephemeral state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub participant_id: Uuid,
    /// Epoch millis, set once per connection.
    pub online_since: u64,
    pub cursor: Option<CursorPosition>,
    pub is_editing: bool,
    pub has_focus: bool,
}

/// Reconciled, profile-enriched record for one (document, participant).
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub participant_id: Uuid,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub contact_ref: Option<String>,
    pub online_since: u64,
    pub cursor: Option<CursorPosition>,
    pub is_editing: bool,
    pub has_focus: bool,
}

impl PresenceRecord {
    fn from_state(state: &PresenceState, profile: Profile) -> Self {
        Self {
            participant_id: state.participant_id,
            display_name: profile.display_name,
            avatar_ref: profile.avatar_ref,
            contact_ref: profile.contact_ref,
            online_since: state.online_since,
            cursor: state.cursor,
            is_editing: state.is_editing,
            has_focus: state.has_focus,
        }
    }

    fn apply_state(&mut self, state: &PresenceState) {
        self.online_since = state.online_since;
        self.cursor = state.cursor;
        self.is_editing = state.is_editing;
        self.has_focus = state.has_focus;
    }
}

/// Authoritative local view of all participants on one document.
pub struct PresenceStore {
    document_id: Uuid,
    local: PresenceRecord,
    /// Baseline for re-announcement suppression: the state as last put on
    /// the wire. Announcing only on real change avoids announcement
    /// storms from continuous pointer movement.
    last_announced: Option<PresenceState>,
    /// Remote participants, keyed by participant id. At most one record
    /// per (document, participant) is authoritative at any instant.
    remote: HashMap<Uuid, PresenceRecord>,
    profiles: ProfileCache,
    /// Highest snapshot seq applied; stale snapshots are ignored.
    last_sync_seq: u64,
}

impl PresenceStore {
    pub fn new(
        document_id: Uuid,
        participant_id: Uuid,
        profile: Profile,
        online_since: u64,
        profiles: ProfileCache,
    ) -> Self {
        let local = PresenceRecord {
            participant_id,
            display_name: profile.display_name,
            avatar_ref: profile.avatar_ref,
            contact_ref: profile.contact_ref,
            online_since,
            cursor: None,
            is_editing: false,
            has_focus: false,
        };
        Self {
            document_id,
            local,
            last_announced: None,
            remote: HashMap::new(),
            profiles,
            last_sync_seq: 0,
        }
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn local(&self) -> &PresenceRecord {
        &self.local
    }

    fn local_state(&self) -> PresenceState {
        PresenceState {
            participant_id: self.local.participant_id,
            online_since: self.local.online_since,
            cursor: self.local.cursor,
            is_editing: self.local.is_editing,
            has_focus: self.local.has_focus,
        }
    }

    /// Produce the local announcement and record it as the suppression
    /// baseline. Called once on join and again whenever a field changes.
    pub fn announce(&mut self) -> PresenceState {
        let state = self.local_state();
        self.last_announced = Some(state.clone());
        state
    }

    /// Move the local cursor. Returns a re-announcement only if the
    /// position differs from the last announced one.
    pub fn update_cursor(&mut self, cursor: CursorPosition) -> Option<PresenceState> {
        self.local.cursor = Some(cursor);
        match &self.last_announced {
            Some(prev) if prev.cursor == Some(cursor) => None,
            _ => Some(self.announce()),
        }
    }

    /// Flip the local editing flag. Announces only on a real flip.
    pub fn set_editing(&mut self, editing: bool) -> Option<PresenceState> {
        self.local.is_editing = editing;
        match &self.last_announced {
            Some(prev) if prev.is_editing == editing => None,
            _ => Some(self.announce()),
        }
    }

    /// Flip the local focus flag. Announces only on a real flip.
    pub fn set_focus(&mut self, focus: bool) -> Option<PresenceState> {
        self.local.has_focus = focus;
        match &self.last_announced {
            Some(prev) if prev.has_focus == focus => None,
            _ => Some(self.announce()),
        }
    }

    /// Apply a full sync snapshot: wholesale replacement of the remote
    /// view, keyed by participant id, with cached profile metadata merged
    /// in. Emits join/leave/editing notifications for the set difference
    /// against the previous view.
    ///
    /// Snapshots with a seq at or below the last applied one are stale
    /// (late delivery after a fresher snapshot) and are ignored.
    pub fn apply_sync(&mut self, seq: u64, participants: &[PresenceState]) -> Vec<Notification> {
        if seq <= self.last_sync_seq {
            log::debug!(
                "ignoring stale presence snapshot seq={seq} (have {})",
                self.last_sync_seq
            );
            return Vec::new();
        }
        self.last_sync_seq = seq;

        let mut notes = Vec::new();
        let mut next: HashMap<Uuid, PresenceRecord> = HashMap::with_capacity(participants.len());

        for state in participants {
            if state.participant_id == self.local.participant_id {
                continue;
            }
            match self.remote.get(&state.participant_id) {
                Some(prev) => {
                    if !prev.is_editing && state.is_editing {
                        notes.push(Notification::NowEditing {
                            participant_id: state.participant_id,
                            display_name: prev.display_name.clone(),
                        });
                    }
                    let mut record = prev.clone();
                    record.apply_state(state);
                    next.insert(state.participant_id, record);
                }
                None => {
                    let profile = self.profiles.resolve(state.participant_id);
                    let record = PresenceRecord::from_state(state, profile);
                    notes.push(Notification::Joined {
                        participant_id: record.participant_id,
                        display_name: record.display_name.clone(),
                    });
                    next.insert(state.participant_id, record);
                }
            }
        }

        for (id, prev) in &self.remote {
            if !next.contains_key(id) {
                notes.push(Notification::Left {
                    participant_id: *id,
                    display_name: prev.display_name.clone(),
                });
            }
        }

        self.remote = next;
        notes
    }

    /// Apply a join delta. Notifies exactly once per absent→present
    /// transition; duplicate joins for an already-present id just refresh
    /// the record.
    pub fn apply_join(&mut self, state: &PresenceState) -> Vec<Notification> {
        if state.participant_id == self.local.participant_id {
            return Vec::new();
        }
        let mut notes = Vec::new();
        match self.remote.get_mut(&state.participant_id) {
            Some(record) => {
                if !record.is_editing && state.is_editing {
                    notes.push(Notification::NowEditing {
                        participant_id: state.participant_id,
                        display_name: record.display_name.clone(),
                    });
                }
                record.apply_state(state);
            }
            None => {
                let profile = self.profiles.resolve(state.participant_id);
                let record = PresenceRecord::from_state(state, profile);
                notes.push(Notification::Joined {
                    participant_id: record.participant_id,
                    display_name: record.display_name.clone(),
                });
                self.remote.insert(state.participant_id, record);
            }
        }
        notes
    }

    /// Apply a leave delta. Notifies once per present→absent transition.
    pub fn apply_leave(&mut self, participant_id: Uuid) -> Vec<Notification> {
        match self.remote.remove(&participant_id) {
            Some(record) => vec![Notification::Left {
                participant_id,
                display_name: record.display_name,
            }],
            None => Vec::new(),
        }
    }

    /// Remote participants (the local record is excluded — the projector
    /// never renders the user's own cursor).
    pub fn remote_participants(&self) -> impl Iterator<Item = &PresenceRecord> {
        self.remote.values()
    }

    /// Full reconciled roster, local record first. For avatar strips and
    /// participant lists, not for cursor projection.
    pub fn participants(&self) -> impl Iterator<Item = &PresenceRecord> {
        std::iter::once(&self.local).chain(self.remote.values())
    }

    pub fn contains(&self, participant_id: Uuid) -> bool {
        self.remote.contains_key(&participant_id)
    }

    /// Remote participant count.
    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use std::sync::Arc;

    fn store_with(local: Uuid, known: &[(Uuid, &str)]) -> PresenceStore {
        let mut dir = StaticDirectory::new();
        for (id, name) in known {
            dir.insert(*id, Profile::named(*name));
        }
        let cache = ProfileCache::new(Arc::new(dir));
        PresenceStore::new(Uuid::new_v4(), local, Profile::named("Local"), 1_000, cache)
    }

    fn state(id: Uuid, editing: bool) -> PresenceState {
        PresenceState {
            participant_id: id,
            online_since: 2_000,
            cursor: None,
            is_editing: editing,
            has_focus: true,
        }
    }

    #[test]
    fn test_cursor_announcement_suppression() {
        let mut store = store_with(Uuid::new_v4(), &[]);
        store.announce();

        let pos = CursorPosition {
            anchor_start: 5,
            anchor_end: 5,
            screen: Some((10.0, 20.0)),
        };
        // First change announces exactly once.
        assert!(store.update_cursor(pos).is_some());
        // Identical position is suppressed.
        assert!(store.update_cursor(pos).is_none());
        // A real move announces again.
        let moved = CursorPosition {
            anchor_start: 6,
            anchor_end: 6,
            screen: Some((11.0, 20.0)),
        };
        assert!(store.update_cursor(moved).is_some());
    }

    #[test]
    fn test_editing_flag_suppression() {
        let mut store = store_with(Uuid::new_v4(), &[]);
        store.announce();

        assert!(store.set_editing(true).is_some());
        assert!(store.set_editing(true).is_none());
        assert!(store.set_editing(false).is_some());
    }

    #[test]
    fn test_join_delta_notifies_once() {
        let local = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut store = store_with(local, &[(bob, "Bob")]);

        let notes = store.apply_join(&state(bob, false));
        assert_eq!(notes.len(), 1);
        assert!(matches!(
            &notes[0],
            Notification::Joined { display_name, .. } if display_name == "Bob"
        ));

        // Duplicate join for an already-present id is an idempotent no-op.
        let notes = store.apply_join(&state(bob, false));
        assert!(notes.is_empty());
        assert_eq!(store.remote_count(), 1);
    }

    #[test]
    fn test_own_join_is_ignored() {
        let local = Uuid::new_v4();
        let mut store = store_with(local, &[]);
        let notes = store.apply_join(&state(local, false));
        assert!(notes.is_empty());
        assert_eq!(store.remote_count(), 0);
    }

    #[test]
    fn test_leave_notifies_once() {
        let local = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut store = store_with(local, &[(bob, "Bob")]);

        store.apply_join(&state(bob, false));
        let notes = store.apply_leave(bob);
        assert_eq!(notes.len(), 1);
        assert!(matches!(&notes[0], Notification::Left { .. }));

        // Second leave for an absent id: nothing.
        assert!(store.apply_leave(bob).is_empty());
    }

    #[test]
    fn test_sync_replaces_view_wholesale() {
        let local = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let carol = Uuid::new_v4();
        let mut store = store_with(local, &[(bob, "Bob"), (carol, "Carol")]);

        let notes = store.apply_sync(1, &[state(bob, false), state(local, false)]);
        assert_eq!(notes.len(), 1); // Bob joined; local self excluded
        assert!(store.contains(bob));
        assert_eq!(store.remote_count(), 1);

        // Next snapshot: Bob gone, Carol present.
        let notes = store.apply_sync(2, &[state(carol, false)]);
        let mut joined = 0;
        let mut left = 0;
        for n in &notes {
            match n {
                Notification::Joined { .. } => joined += 1,
                Notification::Left { .. } => left += 1,
                other => panic!("unexpected notification {other:?}"),
            }
        }
        assert_eq!((joined, left), (1, 1));
        assert!(store.contains(carol));
        assert!(!store.contains(bob));
    }

    #[test]
    fn test_stale_snapshot_is_ignored() {
        let local = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut store = store_with(local, &[(bob, "Bob")]);

        store.apply_sync(5, &[state(bob, false)]);
        assert!(store.contains(bob));

        // A late-arriving older snapshot must not roll the view back.
        let notes = store.apply_sync(3, &[]);
        assert!(notes.is_empty());
        assert!(store.contains(bob));
    }

    #[test]
    fn test_editing_flip_notifies_via_sync() {
        let local = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut store = store_with(local, &[(bob, "Bob")]);

        store.apply_sync(1, &[state(bob, false)]);
        let notes = store.apply_sync(2, &[state(bob, true)]);
        assert_eq!(notes.len(), 1);
        assert!(matches!(
            &notes[0],
            Notification::NowEditing { display_name, .. } if display_name == "Bob"
        ));

        // Still editing in the next snapshot: no repeat notification.
        let notes = store.apply_sync(3, &[state(bob, true)]);
        assert!(notes.is_empty());
    }

    #[test]
    fn test_join_leave_sequence_converges() {
        // For any sequence of deltas, the reconciled set equals the set of
        // participants whose last delta was a join.
        let local = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut store = store_with(local, &[(a, "A"), (b, "B")]);

        store.apply_join(&state(a, false));
        store.apply_join(&state(b, false));
        store.apply_join(&state(a, false)); // duplicate, no double-count
        store.apply_leave(b);
        store.apply_join(&state(b, false));
        store.apply_leave(a);

        assert_eq!(store.remote_count(), 1);
        assert!(store.contains(b));
        assert!(!store.contains(a));
    }

    #[test]
    fn test_roster_lists_local_first() {
        let local = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut store = store_with(local, &[(bob, "Bob")]);
        store.apply_join(&state(bob, false));

        let roster: Vec<Uuid> = store.participants().map(|r| r.participant_id).collect();
        assert_eq!(roster, vec![local, bob]);
    }

    #[test]
    fn test_unknown_participant_gets_anonymous_profile() {
        let local = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let mut store = store_with(local, &[]);

        store.apply_join(&state(stranger, false));
        let record = store.remote_participants().next().unwrap();
        assert_eq!(record.display_name, "Anonymous");
    }
}
