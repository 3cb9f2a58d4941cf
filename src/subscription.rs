//! Explicit lifecycle state machine for channel subscriptions.
//!
//! A subscription is the unit of resource acquisition: opening must be
//! paired with closing on every exit path (unmount, navigation away,
//! document switch), or the server keeps a phantom "still online" slot.
//!
//! ```text
//! closed ──open-requested──► opening ──open-confirmed──► synced
//!    ▲                                                      │
//!    │                                              snapshot-applied
//! close-confirmed                                           ▼
//!    │                                                   active
//!    └───────── closing ◄──────close-requested─────────────┘
//! ```
//!
//! All transitions go through a single [`SubscriptionState::apply`]
//! dispatch function so ordering and teardown guarantees are checkable;
//! events are only accepted while the machine is synced or active.

use crate::error::CollabError;
use crate::protocol::Purpose;

/// Lifecycle phase of one (document, purpose) subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionPhase {
    Closed,
    Opening,
    Synced,
    Active,
    Closing,
}

impl SubscriptionPhase {
    pub fn name(&self) -> &'static str {
        match self {
            SubscriptionPhase::Closed => "closed",
            SubscriptionPhase::Opening => "opening",
            SubscriptionPhase::Synced => "synced",
            SubscriptionPhase::Active => "active",
            SubscriptionPhase::Closing => "closing",
        }
    }
}

/// Inputs to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionInput {
    /// Caller asked to open the channel.
    OpenRequested,
    /// Transport confirmed the channel is open.
    OpenConfirmed,
    /// The authoritative seed state (presence snapshot, comment list)
    /// has been applied locally.
    SnapshotApplied,
    /// Caller asked to tear down. Legal from every phase; idempotent.
    CloseRequested,
    /// Teardown finished, transport resources released.
    CloseConfirmed,
}

impl SubscriptionInput {
    fn name(&self) -> &'static str {
        match self {
            SubscriptionInput::OpenRequested => "open-requested",
            SubscriptionInput::OpenConfirmed => "open-confirmed",
            SubscriptionInput::SnapshotApplied => "snapshot-applied",
            SubscriptionInput::CloseRequested => "close-requested",
            SubscriptionInput::CloseConfirmed => "close-confirmed",
        }
    }
}

/// State machine for one subscription.
#[derive(Debug)]
pub struct SubscriptionState {
    purpose: Purpose,
    phase: SubscriptionPhase,
}

impl SubscriptionState {
    pub fn new(purpose: Purpose) -> Self {
        Self {
            purpose,
            phase: SubscriptionPhase::Closed,
        }
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn phase(&self) -> SubscriptionPhase {
        self.phase
    }

    /// Whether inbound events may mutate local state right now.
    ///
    /// Once teardown is requested this returns false, so events already
    /// in flight cannot touch state.
    pub fn accepts_events(&self) -> bool {
        matches!(
            self.phase,
            SubscriptionPhase::Synced | SubscriptionPhase::Active
        )
    }

    /// Apply one input, returning the new phase.
    pub fn apply(&mut self, input: SubscriptionInput) -> Result<SubscriptionPhase, CollabError> {
        use SubscriptionInput as I;
        use SubscriptionPhase as P;

        let next = match (self.phase, input) {
            (P::Closed, I::OpenRequested) => P::Opening,
            (P::Opening, I::OpenConfirmed) => P::Synced,
            (P::Synced, I::SnapshotApplied) => P::Active,
            // Re-syncs while active are normal (snapshots are authoritative).
            (P::Active, I::SnapshotApplied) => P::Active,
            (P::Closed, I::CloseRequested) => P::Closed,
            (_, I::CloseRequested) => P::Closing,
            (P::Closing, I::CloseConfirmed) => P::Closed,
            (from, input) => {
                return Err(CollabError::InvalidTransition {
                    from: from.name(),
                    input: input.name(),
                })
            }
        };

        if next != self.phase {
            log::debug!(
                "subscription {:?}: {} -> {}",
                self.purpose,
                self.phase.name(),
                next.name()
            );
        }
        self.phase = next;
        Ok(next)
    }
}
