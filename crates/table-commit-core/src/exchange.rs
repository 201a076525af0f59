//! Handing task output to the job coordinator.
//!
//! Distributed writers run as independent tasks that do not share memory
//! with the job coordinator. Each task gathers the files it wrote in a
//! [`TaskFileCollector`] and, when it finishes, records them in a commit file
//! at a location derived from the job and task ids. The coordinator later
//! reads every expected commit file and commits the union in one snapshot.
//!
//! Layout under the table root:
//!
//! ```text
//! temp/<query-id>-<job-id>/task-0.forCommit
//! temp/<query-id>-<job-id>/task-1.forCommit
//! ...
//! ```
//!
//! Commit files are a private intermediate format and are removed once the
//! job commits or aborts.
pub mod collector;
pub mod commit_file;
pub mod job_committer;

pub use collector::TaskFileCollector;
pub use commit_file::{JobContext, read_commit_file, read_commit_files, write_commit_file};
pub use job_committer::JobCommitter;

use snafu::{Backtrace, prelude::*};

use crate::commit::CommitError;
use crate::storage::StorageError;

/// Errors from the commit-file exchange.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ExchangeError {
    /// Reading or writing a commit file failed.
    #[snafu(display("Storage error on commit file {path}: {source}"))]
    Storage {
        /// Commit file location.
        path: String,
        /// Storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// A commit file could not be encoded.
    #[snafu(display("Cannot encode commit file {path}: {source}"))]
    Encode {
        /// Commit file location.
        path: String,
        /// Encoder error.
        source: bincode::error::EncodeError,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A commit file is corrupt or was written by something else.
    #[snafu(display("Cannot decode commit file {path}: {source}"))]
    Decode {
        /// Commit file location.
        path: String,
        /// Decoder error.
        source: bincode::error::DecodeError,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A commit file belongs to a different task than its name says.
    #[snafu(display("Commit file {path} was written by task {found}, expected task {expected}"))]
    TaskMismatch {
        /// Commit file location.
        path: String,
        /// Task id derived from the location.
        expected: u64,
        /// Task id recorded in the file.
        found: u64,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Committing the collected files failed.
    #[snafu(display("Job commit failed: {source}"))]
    Commit {
        /// Commit error.
        #[snafu(backtrace)]
        source: CommitError,
    },
}
