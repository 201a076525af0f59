//! Running a planned rewrite end to end.
//!
//! The driver rewrites groups with bounded parallelism through a
//! [`GroupRewriter`] (the physical file writer lives outside this crate) and
//! then commits them:
//!
//! - Without partial progress, all groups are committed in one
//!   [`commit_or_clean`](RewriteCommitManager::commit_or_clean). A single
//!   failed rewrite aborts every rewritten group and fails the run.
//! - With partial progress, groups are offered to a [`CommitService`] as
//!   they finish, `ceil(groups / max_commits)` per commit. Failed rewrites
//!   are skipped.
//!
//! [`CommitService`]: crate::rewrite::CommitService
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use log::{info, warn};

use crate::config::PartialProgressConfig;
use crate::model::DataFile;
use crate::rewrite::{FileGroupInfo, RewriteCommitManager, RewriteError, RewriteFileGroup};

/// Error type returned by rewriters.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Writes the replacement files for one group.
#[async_trait]
pub trait GroupRewriter: Send + Sync {
    /// Rewrite `group` and return the files written.
    async fn rewrite(&self, group: &RewriteFileGroup) -> Result<Vec<DataFile>, BoxError>;
}

/// Outcome of a rewrite run.
#[derive(Debug, Clone, Default)]
pub struct RewriteResult {
    /// Groups whose output is now part of the table.
    pub committed_groups: Vec<RewriteFileGroup>,
    /// Groups that failed to rewrite or whose commit failed.
    pub failed_groups: Vec<FileGroupInfo>,
    /// Input files retired by committed groups.
    pub rewritten_files_count: usize,
    /// Output files introduced by committed groups.
    pub added_files_count: usize,
}

impl RewriteResult {
    fn from_committed(committed: Vec<RewriteFileGroup>, failed: Vec<FileGroupInfo>) -> Self {
        let rewritten_files_count = committed.iter().map(|g| g.num_files()).sum();
        let added_files_count = committed
            .iter()
            .map(|g| g.added_files().map_or(0, <[DataFile]>::len))
            .sum();
        Self {
            committed_groups: committed,
            failed_groups: failed,
            rewritten_files_count,
            added_files_count,
        }
    }
}

/// Rewrites and commits a set of planned groups.
#[derive(Debug, Clone)]
pub struct RewriteDriver<R> {
    manager: RewriteCommitManager,
    rewriter: Arc<R>,
    max_concurrent_rewrites: usize,
    partial_progress: PartialProgressConfig,
}

impl<R: GroupRewriter + 'static> RewriteDriver<R> {
    /// A driver using the table's partial-progress settings.
    pub fn new(manager: RewriteCommitManager, rewriter: Arc<R>) -> Self {
        let partial_progress = manager.table().config().partial_progress;
        Self {
            manager,
            rewriter,
            max_concurrent_rewrites: 1,
            partial_progress,
        }
    }

    /// How many groups are rewritten at once.
    pub fn with_max_concurrent_rewrites(mut self, n: usize) -> Self {
        self.max_concurrent_rewrites = n.max(1);
        self
    }

    /// Override the partial-progress settings.
    pub fn with_partial_progress(mut self, partial_progress: PartialProgressConfig) -> Self {
        self.partial_progress = partial_progress;
        self
    }

    /// Rewrite and commit `groups`.
    pub async fn execute(
        &self,
        groups: Vec<RewriteFileGroup>,
    ) -> Result<RewriteResult, RewriteError> {
        if groups.is_empty() {
            info!("Nothing found to rewrite in {}", self.manager.table().name());
            return Ok(RewriteResult::default());
        }

        let started = Instant::now();
        let total = groups.len();
        let result = if self.partial_progress.enabled {
            self.execute_with_partial_progress(groups).await
        } else {
            self.execute_all_at_once(groups).await
        }?;

        info!(
            "Rewrite of {} finished in {}ms: {} of {total} groups committed, {} files rewritten into {}",
            self.manager.table().name(),
            started.elapsed().as_millis(),
            result.committed_groups.len(),
            result.rewritten_files_count,
            result.added_files_count
        );
        Ok(result)
    }

    fn rewrites(
        &self,
        groups: Vec<RewriteFileGroup>,
    ) -> impl futures::Stream<Item = (RewriteFileGroup, Result<Vec<DataFile>, BoxError>)> + '_ {
        stream::iter(groups)
            .map(move |group| {
                let rewriter = Arc::clone(&self.rewriter);
                async move {
                    let output = rewriter.rewrite(&group).await;
                    (group, output)
                }
            })
            .buffer_unordered(self.max_concurrent_rewrites)
    }

    async fn execute_all_at_once(
        &self,
        groups: Vec<RewriteFileGroup>,
    ) -> Result<RewriteResult, RewriteError> {
        let mut rewritten = Vec::with_capacity(groups.len());
        let mut first_failure: Option<(usize, BoxError)> = None;

        let mut rewrites = Box::pin(self.rewrites(groups));
        while let Some((mut group, output)) = rewrites.next().await {
            match output {
                Ok(files) => {
                    group.set_output_files(files);
                    rewritten.push(group);
                }
                Err(e) => {
                    warn!("Failure during rewrite of file group {group}: {e}");
                    first_failure.get_or_insert((group.info().global_index, e));
                }
            }
        }

        if let Some((group, source)) = first_failure {
            for done in &rewritten {
                if let Err(e) = self.manager.abort_file_group(done).await {
                    warn!("Failed to abort file group {done}: {e}");
                }
            }
            return Err(RewriteError::Rewrite { group, source });
        }

        rewritten.sort_by_key(|g| g.info().global_index);
        self.manager.commit_or_clean(&rewritten).await?;
        Ok(RewriteResult::from_committed(rewritten, Vec::new()))
    }

    async fn execute_with_partial_progress(
        &self,
        groups: Vec<RewriteFileGroup>,
    ) -> Result<RewriteResult, RewriteError> {
        let all: Vec<FileGroupInfo> = groups.iter().map(|g| g.info().clone()).collect();
        let max_commits = self.partial_progress.max_commits.max(1);
        let rewrites_per_commit = groups.len().div_ceil(max_commits);

        let service = self.manager.service(rewrites_per_commit);
        service.start()?;

        let mut rewrites = Box::pin(self.rewrites(groups));
        while let Some((mut group, output)) = rewrites.next().await {
            match output {
                Ok(files) => {
                    group.set_output_files(files);
                    service.offer(group)?;
                }
                Err(e) => warn!("Failure during rewrite of file group {group}, skipping: {e}"),
            }
        }

        service.close().await?;
        let committed = service.results()?;

        let failed = all
            .into_iter()
            .filter(|info| !committed.iter().any(|g| g.info() == info))
            .collect();
        Ok(RewriteResult::from_committed(committed, failed))
    }
}
