//! Error handling for arbor operations.
//!
//! All public APIs return `Result<T, StoreError>`. Errors are never retried
//! internally: `OutOfMemory` and `PageNotFound` propagate directly to the
//! caller, and [`Snapshot::rollback`](crate::snapshot::Snapshot::rollback)
//! is the explicit, caller-invoked recovery path for a whole transaction.

use crate::ids::PageId;
use std::io;
use thiserror::Error;

/// Result type for arbor operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur while operating on the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The block allocator's memory ceiling would be exceeded.
    ///
    /// The triggering operation has no effect: no page or directory
    /// mutation is performed before the allocation is charged.
    #[error("out of memory: requested {requested} bytes, {in_use} in use, ceiling {ceiling}")]
    OutOfMemory {
        /// Bytes the failed allocation asked for.
        requested: usize,
        /// Bytes currently charged against the ceiling.
        in_use: usize,
        /// The configured ceiling.
        ceiling: usize,
    },

    /// A directory lookup for a referenced page id failed.
    ///
    /// This is a fatal corruption/misuse signal and is never retried.
    #[error("{0} not found")]
    PageNotFound(PageId),

    /// An operation was invoked on a snapshot in the wrong lifecycle state,
    /// e.g. `commit()` twice, mutating after rollback, or branching a
    /// snapshot that has not been committed.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A structural invariant does not hold: a node's coarse index disagrees
    /// with its keys, a refcount went negative, or the directory disagrees
    /// with the history graph about visibility.
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    /// The fixed-capacity page guard pool has no free slot.
    ///
    /// The pool never grows; treat this as fatal for the operation and
    /// release guards before retrying at the caller's discretion.
    #[error("guard pool exhausted: all {0} slots in use")]
    GuardPoolExhausted(usize),

    /// Payload codec failure while encoding or decoding a leaf value.
    #[error("codec error: {0}")]
    Codec(String),

    /// I/O error from a node persistence stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        StoreError::InvalidState(msg.into())
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        StoreError::ConsistencyViolation(msg.into())
    }
}
