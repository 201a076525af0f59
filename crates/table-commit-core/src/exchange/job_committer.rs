//! Task and job commit for distributed writes.
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use snafu::prelude::*;

use crate::commit::{CommitOutcome, TableOperation};
use crate::exchange::{
    CommitSnafu, ExchangeError, JobContext, TaskFileCollector, read_commit_files,
    write_commit_file,
};
use crate::io::delete_with_retry;
use crate::model::DataFile;
use crate::table::Table;

/// Commits the output of a distributed write job to a table.
///
/// Tasks call [`commit_task`](Self::commit_task) or
/// [`abort_task`](Self::abort_task); the coordinator then calls
/// [`commit_job`](Self::commit_job) or [`abort_job`](Self::abort_job) once.
#[derive(Debug, Clone)]
pub struct JobCommitter {
    table: Arc<Table>,
}

impl JobCommitter {
    /// Committer writing to `table`.
    pub fn new(table: Arc<Table>) -> Self {
        Self { table }
    }

    /// Record the files of a finished task for the coordinator.
    pub async fn commit_task(
        &self,
        job: &JobContext,
        task_id: u64,
        collector: &TaskFileCollector,
    ) -> Result<String, ExchangeError> {
        write_commit_file(self.table.io().as_ref(), job, task_id, collector.files()).await
    }

    /// Delete the files of a failed task. Failures are logged and ignored.
    pub async fn abort_task(&self, collector: &TaskFileCollector) {
        self.delete_files(collector.files()).await;
    }

    /// Commit the files of tasks `0..expected_tasks` as one append.
    ///
    /// Every commit file must be readable. Nothing is committed when the
    /// tasks wrote no files. The job's commit files are removed afterwards
    /// in either case.
    pub async fn commit_job(
        &self,
        job: &JobContext,
        expected_tasks: u64,
    ) -> Result<Option<CommitOutcome>, ExchangeError> {
        let started = Instant::now();
        let config = self.table.config();
        let files = read_commit_files(
            self.table.io().as_ref(),
            job,
            expected_tasks,
            config.commit_file_pool_size,
            config.commit_file_read_attempts,
            true,
        )
        .await?;
        debug!(
            "Read {} files from {expected_tasks} commit files of job {}-{} in {}ms",
            files.len(),
            job.query_id,
            job.job_id,
            started.elapsed().as_millis()
        );

        let outcome = if files.is_empty() {
            info!("Job {}-{} wrote no files, nothing to commit", job.query_id, job.job_id);
            None
        } else {
            let count = files.len();
            let outcome = self
                .table
                .commit(TableOperation::Append { files })
                .await
                .context(CommitSnafu)?;
            info!(
                "Committed {count} files of job {}-{} to {} as snapshot {} in {}ms",
                job.query_id,
                job.job_id,
                self.table.name(),
                outcome.snapshot_id,
                started.elapsed().as_millis()
            );
            Some(outcome)
        };

        self.clean_up(job).await;
        Ok(outcome)
    }

    /// Delete every file the job's tasks recorded, then its commit files.
    ///
    /// Best effort throughout: unreadable commit files and failed deletes
    /// are logged and skipped.
    pub async fn abort_job(&self, job: &JobContext, expected_tasks: u64) {
        let config = self.table.config();
        let files = read_commit_files(
            self.table.io().as_ref(),
            job,
            expected_tasks,
            config.commit_file_pool_size,
            config.commit_file_read_attempts,
            false,
        )
        .await
        .unwrap_or_else(|e| {
            warn!("Cannot read commit files of job {}-{}: {e}", job.query_id, job.job_id);
            Vec::new()
        });

        self.delete_files(&files).await;
        self.clean_up(job).await;
    }

    async fn delete_files(&self, files: &[DataFile]) {
        let io = self.table.io().as_ref();
        let attempts = self.table.config().cleanup_delete_attempts;
        for file in files {
            if let Err(e) = delete_with_retry(io, &file.path, false, attempts).await {
                warn!("Failed to delete {}: {e}", file.path);
            }
        }
    }

    async fn clean_up(&self, job: &JobContext) {
        let temp_dir = job.temp_dir();
        let attempts = self.table.config().cleanup_delete_attempts;
        if let Err(e) = delete_with_retry(self.table.io().as_ref(), &temp_dir, true, attempts).await {
            warn!("Failed to clean up job directory {temp_dir}: {e}");
        }
    }
}
