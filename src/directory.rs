//! Profile lookup boundary and per-subscription cache.
//!
//! The core never stores profiles; it asks the host's directory and
//! caches the answer for the lifetime of the subscription so snapshots
//! do not refetch. A failed lookup degrades to the anonymous profile —
//! it never blocks a feature.

use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::CollabError;

/// Display metadata for one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub contact_ref: Option<String>,
}

impl Profile {
    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            avatar_ref: None,
            contact_ref: None,
        }
    }

    /// Fallback used whenever lookup fails.
    pub fn anonymous() -> Self {
        Self::named("Anonymous")
    }
}

/// Host-provided profile directory.
pub trait ProfileDirectory: Send + Sync {
    /// Resolve a participant's display metadata. Unknown participants and
    /// backend failures both map to [`CollabError::ProfileLookupFailure`].
    fn lookup(&self, participant_id: Uuid) -> Result<Profile, CollabError>;
}

/// Caches lookups per participant id for the lifetime of a subscription.
///
/// Failures are cached too (as the anonymous profile) so a flaky
/// directory is not hammered on every presence snapshot.
pub struct ProfileCache {
    directory: Arc<dyn ProfileDirectory>,
    cached: HashMap<Uuid, Profile>,
}

impl ProfileCache {
    pub fn new(directory: Arc<dyn ProfileDirectory>) -> Self {
        Self {
            directory,
            cached: HashMap::new(),
        }
    }

    /// Resolve a profile, hitting the directory at most once per id.
    pub fn resolve(&mut self, participant_id: Uuid) -> Profile {
        if let Some(profile) = self.cached.get(&participant_id) {
            return profile.clone();
        }
        let profile = match self.directory.lookup(participant_id) {
            Ok(profile) => profile,
            Err(e) => {
                log::debug!("profile lookup for {participant_id} failed ({e}), using anonymous");
                Profile::anonymous()
            }
        };
        self.cached.insert(participant_id, profile.clone());
        profile
    }

    pub fn len(&self) -> usize {
        self.cached.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cached.is_empty()
    }
}

/// Fixed in-memory directory, used by tests and local/offline sessions.
#[derive(Default)]
pub struct StaticDirectory {
    profiles: HashMap<Uuid, Profile>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, participant_id: Uuid, profile: Profile) {
        self.profiles.insert(participant_id, profile);
    }

    pub fn with(mut self, participant_id: Uuid, display_name: &str) -> Self {
        self.insert(participant_id, Profile::named(display_name));
        self
    }
}

impl ProfileDirectory for StaticDirectory {
    fn lookup(&self, participant_id: Uuid) -> Result<Profile, CollabError> {
        self.profiles
            .get(&participant_id)
            .cloned()
            .ok_or(CollabError::ProfileLookupFailure)
    }
}
