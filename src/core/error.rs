//! Error types for matching and allocation operations.

use thiserror::Error;

use crate::util::serde::{EntryId, EntryStatus, RequesterId, ResourceId, ResourceStatus};

/// Errors produced by engine components.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MatchError {
    /// Vector length disagrees with the configured embedding dimension.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Configured dimension.
        expected: usize,
        /// Length of the offending vector.
        got: usize,
    },
    /// The requester already has a pending entry on this resource.
    #[error("duplicate pending entry for `{requester_id}` on resource {resource_id}")]
    DuplicatePending {
        /// Resource the entry belongs to.
        resource_id: ResourceId,
        /// Requester holding the pending entry.
        requester_id: RequesterId,
    },
    /// The entry already left the pending state.
    #[error("entry {entry_id} is already terminal ({status:?})")]
    AlreadyTerminal {
        /// Entry identifier.
        entry_id: EntryId,
        /// Terminal status it holds.
        status: EntryStatus,
    },
    /// Nothing could be allocated or queued for the query.
    #[error("no viable match")]
    NoViableMatch,
    /// The external ranking model failed or is not installed.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    /// Capacity accounting broke; indicates a locking bug, never bad input.
    #[error("capacity invariant violated on resource {resource_id}: {detail}")]
    CapacityInvariantViolation {
        /// Resource whose ledger is inconsistent.
        resource_id: ResourceId,
        /// What went wrong.
        detail: String,
    },
    /// No resource with this identifier is registered.
    #[error("unknown resource {0}")]
    UnknownResource(ResourceId),
    /// No waitlist entry with this identifier exists.
    #[error("unknown entry {0}")]
    UnknownEntry(EntryId),
    /// A resource with this identifier is already registered.
    #[error("resource {0} already exists")]
    ResourceExists(ResourceId),
    /// The resource no longer admits requests.
    #[error("resource {resource_id} is {status:?}")]
    ResourceInactive {
        /// Resource identifier.
        resource_id: ResourceId,
        /// Current status.
        status: ResourceStatus,
    },
    /// The per-resource waitlist is at its configured depth.
    #[error("waitlist full for resource {resource_id} (max {max_depth})")]
    WaitlistFull {
        /// Resource identifier.
        resource_id: ResourceId,
        /// Configured maximum depth.
        max_depth: usize,
    },
    /// Rejected unit count change (e.g. shrinking below units on loan).
    #[error("invalid unit change on resource {resource_id}: {detail}")]
    InvalidUnits {
        /// Resource identifier.
        resource_id: ResourceId,
        /// Reason.
        detail: String,
    },
    /// The requester id is empty or blank.
    #[error("invalid requester id {0}")]
    InvalidRequester(String),
    /// Listing metadata failed validation.
    #[error("invalid listing: {0}")]
    InvalidListing(String),
    /// The embedding collaborator failed or produced an unusable vector.
    #[error("embedding failed: {0}")]
    Embedding(String),
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MatchError {
    /// Whether the error is an expected, per-call outcome rather than a fault.
    ///
    /// Invariant violations and dimension/config errors are not recoverable.
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DuplicatePending { .. }
                | Self::AlreadyTerminal { .. }
                | Self::NoViableMatch
                | Self::ModelUnavailable(_)
                | Self::WaitlistFull { .. }
                | Self::ResourceInactive { .. }
                | Self::InvalidRequester(_)
        )
    }

    /// Whether the orchestrator should move on to the next-ranked candidate.
    pub(crate) const fn falls_through(&self) -> bool {
        matches!(
            self,
            Self::DuplicatePending { .. }
                | Self::ResourceInactive { .. }
                | Self::UnknownResource(_)
                | Self::WaitlistFull { .. }
        )
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
