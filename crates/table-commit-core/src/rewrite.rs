//! Rewrite coordination.
//!
//! - [`RewriteFileGroup`]: input files plus the files a rewrite produced.
//! - [`RewriteCommitManager`]: commits groups as one replace operation and
//!   cleans up after failed commits.
//! - [`CommitService`]: background committer for partial progress.
//! - [`RewriteDriver`]: runs rewrites in parallel and feeds one of the above.
pub mod commit_manager;
pub mod commit_service;
pub mod driver;
pub mod file_group;

pub use commit_manager::RewriteCommitManager;
pub use commit_service::{CommitService, ServiceState};
pub use driver::{BoxError, GroupRewriter, RewriteDriver, RewriteResult};
pub use file_group::{FileGroupInfo, RewriteFileGroup};

use snafu::{Backtrace, prelude::*};

use crate::commit::CommitError;

/// Errors from rewrite coordination.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RewriteError {
    /// Committing the groups failed.
    #[snafu(display("Rewrite commit failed: {source}"))]
    Commit {
        /// Commit error; decides whether cleanup happened.
        #[snafu(backtrace)]
        source: CommitError,
    },

    /// An operation was called in the wrong state.
    #[snafu(display("Illegal state: {msg}"))]
    IllegalState {
        /// What was wrong.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Closing the commit service timed out.
    #[snafu(display(
        "Timeout occurred when waiting for commits to complete. {committed} file groups committed. \
         {uncommitted} file groups remain uncommitted. Retry this operation to attempt rewriting the failed groups."
    ))]
    ServiceTimeout {
        /// Groups committed before the timeout.
        committed: usize,
        /// Groups queued or still being committed.
        uncommitted: usize,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The committer task died.
    #[snafu(display("Commit service failed: {msg}"))]
    ServiceFailed {
        /// Cause.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Rewriting a group failed.
    #[snafu(display("Rewrite of file group {group} failed: {source}"))]
    Rewrite {
        /// Global index of the group.
        group: usize,
        /// Error from the rewriter.
        source: BoxError,
    },
}

impl RewriteError {
    /// Whether a commit may have taken effect and produced files must stay.
    pub fn is_state_unknown(&self) -> bool {
        matches!(self, RewriteError::Commit { source } if source.is_state_unknown())
    }
}
