//! Snapshot commit protocol.
//!
//! A commit turns a [`TableOperation`] into a new snapshot and installs it
//! with a compare-and-swap on the metadata store:
//!
//! 1. Read the current metadata (the *base*).
//! 2. Validate the operation against the base and, for rewrites, against the
//!    snapshots committed since the rewrite started.
//! 3. Write manifests for the delta and derive the new metadata.
//! 4. CAS base -> new. On conflict, back off, re-read the base and start over
//!    from step 2, within the bounds of the [`CommitRetryPolicy`].
//!
//! The failure modes are kept strictly apart:
//!
//! - [`CommitError::StateUnknown`]: the CAS outcome could not be determined.
//!   Files referenced by the attempt may be live; nothing may be cleaned up.
//! - Every other variant: the table is known to be unchanged by this commit
//!   and produced files may be deleted ([`CommitError::is_cleanup_safe`]).
//!
//! [`CommitRetryPolicy`]: crate::config::CommitRetryPolicy
pub mod committer;
pub mod operation;
pub mod manifest_io;
pub mod producer;
pub mod validation;

pub use committer::{CommitOutcome, SnapshotCommitter};
pub use operation::{PartitionFilter, RewriteFiles, TableOperation};
pub use validation::ValidationError;

use snafu::{Backtrace, prelude::*};

use crate::metadata_store::StoreError;
use crate::model::TableMetadataError;
use crate::storage::StorageError;

/// Errors returned by the snapshot commit protocol.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CommitError {
    /// Every CAS attempt lost to a concurrent writer. Nothing was committed.
    #[snafu(display(
        "Commit failed after {attempts} attempts: expected metadata version {expected}, found {found}"
    ))]
    Failed {
        /// CAS attempts made.
        attempts: u32,
        /// Version the last attempt was based on.
        expected: u64,
        /// Version found by the last attempt.
        found: u64,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The outcome of a CAS attempt is unknown; the commit may have succeeded.
    #[snafu(display("Commit state unknown: {reason}"))]
    StateUnknown {
        /// What the store reported.
        reason: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A concurrent change conflicts with the operation. Retrying the same
    /// operation cannot succeed.
    #[snafu(display("Commit validation failed: {source}"))]
    Validation {
        /// What conflicted.
        #[snafu(backtrace)]
        source: ValidationError,
    },

    /// The operation itself is malformed.
    #[snafu(display("Invalid table operation: {msg}"))]
    InvalidOperation {
        /// What is wrong with it.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The new snapshot would break a metadata invariant.
    #[snafu(display("Cannot derive new table metadata: {source}"))]
    Metadata {
        /// Invariant that would be broken.
        source: TableMetadataError,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The metadata store failed without changing the pointer.
    #[snafu(display("Metadata store error: {source}"))]
    Store {
        /// Store error.
        #[snafu(backtrace)]
        source: StoreError,
    },

    /// Reading or writing a manifest failed.
    #[snafu(display("Storage error while writing snapshot: {source}"))]
    Storage {
        /// Storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// A manifest could not be encoded or decoded.
    #[snafu(display("Malformed manifest {location}: {source}"))]
    ManifestCodec {
        /// Manifest location.
        location: String,
        /// JSON error.
        source: serde_json::Error,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

impl CommitError {
    /// Whether the commit may have taken effect.
    pub fn is_state_unknown(&self) -> bool {
        matches!(self, CommitError::StateUnknown { .. })
    }

    /// Whether files produced for this commit can be deleted.
    pub fn is_cleanup_safe(&self) -> bool {
        !self.is_state_unknown()
    }
}
