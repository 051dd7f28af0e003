//! Error types for the grace subsystem.

use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by grace coordinator operations.
///
/// All of these are ordinary errors: a caller referencing an unknown member
/// or attempting a premature lift is a cluster-management mistake, not a
/// defect in this process.
#[derive(Debug, Error)]
pub enum GraceError {
    /// An operation referenced a member with no entry in the grace object.
    #[error("no such member: {member}")]
    NoSuchMember {
        /// The missing member identifier.
        member: String,
    },

    /// `add` was called with a member that already has an entry.
    #[error("member already present: {member}")]
    AlreadyPresent {
        /// The pre-existing member identifier.
        member: String,
    },

    /// A lift was attempted while some member has not started enforcing the
    /// active grace period.
    #[error("cluster not enforcing")]
    NotEnforcing,

    /// The stored grace object is shorter than the two epoch counters.
    #[error("grace object not recoverable")]
    NotRecoverable,

    /// Error from the backing store, surfaced unchanged.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// I/O error while writing a dump.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for grace operations.
pub type Result<T> = std::result::Result<T, GraceError>;
