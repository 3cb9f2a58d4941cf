//! Error taxonomy for the collaboration core.
//!
//! Every asynchronous boundary converts failures into one of these
//! variants before they reach the caller. Presence and chat failures are
//! best-effort and stay silent; comment-persistence failures are the only
//! ones surfaced to the initiating user, because comments are durable
//! data the user explicitly asked to create.

use std::fmt;

/// Failure kinds the core can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollabError {
    /// Transport could not open or keep a channel open. Non-fatal: the
    /// session degrades to local-only and editing is never blocked.
    ChannelUnavailable,
    /// Comment create/update/reply failed at the persistence collaborator.
    /// Local state is not optimistically mutated, so no rollback is needed.
    PersistenceFailure(String),
    /// Profile lookup failed or the participant is unknown. Callers fall
    /// back to the anonymous profile.
    ProfileLookupFailure,
    /// Inbound event was undecodable or missing required fields. Dropped
    /// and logged at the subscription boundary, never crashes dispatch.
    MalformedEvent(String),
    /// Illegal subscription lifecycle transition.
    InvalidTransition {
        from: &'static str,
        input: &'static str,
    },
    /// Comment or reply body was empty.
    EmptyBody,
    /// Comment creation was attempted without a text selection.
    EmptyAnchor,
}

impl fmt::Display for CollabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelUnavailable => write!(f, "channel unavailable"),
            Self::PersistenceFailure(e) => write!(f, "comment persistence failure: {e}"),
            Self::ProfileLookupFailure => write!(f, "profile lookup failed"),
            Self::MalformedEvent(e) => write!(f, "malformed event: {e}"),
            Self::InvalidTransition { from, input } => {
                write!(f, "invalid subscription transition: {input} while {from}")
            }
            Self::EmptyBody => write!(f, "body must not be empty"),
            Self::EmptyAnchor => write!(f, "a non-empty text selection is required"),
        }
    }
}

impl std::error::Error for CollabError {}
