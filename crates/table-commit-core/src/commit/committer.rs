//! The optimistic-concurrency retry loop.
use std::time::Instant;

use log::{debug, error, info, warn};
use snafu::prelude::*;

use crate::commit::producer::{PendingSnapshot, produce};
use crate::commit::{
    CommitError, FailedSnafu, StateUnknownSnafu, StoreSnafu, TableOperation,
};
use crate::config::CommitRetryPolicy;
use crate::io::{FileIo, delete_with_retry};
use crate::metadata_store::{CasOutcome, MetadataHandle, MetadataStore};

/// A successfully installed snapshot.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// Id of the new snapshot.
    pub snapshot_id: i64,
    /// Sequence number of the new snapshot.
    pub sequence_number: i64,
    /// The metadata pointer after the commit.
    pub metadata: MetadataHandle,
    /// CAS attempts it took.
    pub attempts: u32,
}

/// Commits operations against one table's metadata store.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotCommitter<'a> {
    store: &'a dyn MetadataStore,
    io: &'a dyn FileIo,
    retry: CommitRetryPolicy,
    cleanup_attempts: usize,
}

impl<'a> SnapshotCommitter<'a> {
    /// Create a committer.
    pub fn new(
        store: &'a dyn MetadataStore,
        io: &'a dyn FileIo,
        retry: CommitRetryPolicy,
        cleanup_attempts: usize,
    ) -> Self {
        Self {
            store,
            io,
            retry,
            cleanup_attempts,
        }
    }

    /// Apply `op` starting from `base`, retrying on CAS conflicts.
    ///
    /// `base` may be stale; a conflict re-reads the current metadata and the
    /// snapshot is rebuilt and revalidated against it.
    pub async fn commit(
        &self,
        base: MetadataHandle,
        op: &TableOperation,
    ) -> Result<CommitOutcome, CommitError> {
        let started = Instant::now();
        let mut base = base;
        let mut attempt: u32 = 0;
        let mut written: Vec<String> = Vec::new();

        loop {
            attempt += 1;
            let pending = match produce(self.io, &base.metadata, op, &mut written).await {
                Ok(pending) => pending,
                Err(err) => {
                    self.clean_up(&written, &[]).await;
                    return Err(err);
                }
            };
            let PendingSnapshot {
                snapshot_id,
                sequence_number,
                manifests,
                metadata,
            } = pending;

            match self.store.compare_and_swap(&base, metadata).await {
                Ok(CasOutcome::Committed(handle)) => {
                    info!(
                        "Committed snapshot {snapshot_id} (sequence number {sequence_number}, {}) after {attempt} attempt(s)",
                        op.snapshot_operation()
                    );
                    self.clean_up(&written, &manifests).await;
                    return Ok(CommitOutcome {
                        snapshot_id,
                        sequence_number,
                        metadata: handle,
                        attempts: attempt,
                    });
                }
                Ok(CasOutcome::Conflict { expected, found }) => {
                    let retries_used = attempt - 1;
                    let backoff = self.retry.backoff(retries_used);
                    let out_of_time = started.elapsed() + backoff > self.retry.total_timeout;
                    if retries_used >= self.retry.num_retries || out_of_time {
                        warn!(
                            "Giving up commit after {attempt} attempt(s): expected version {expected}, found {found}"
                        );
                        self.clean_up(&written, &[]).await;
                        return FailedSnafu {
                            attempts: attempt,
                            expected,
                            found,
                        }
                        .fail();
                    }

                    debug!(
                        "Commit conflict on attempt {attempt} (expected version {expected}, found {found}); retrying in {}ms",
                        backoff.as_millis()
                    );
                    tokio::time::sleep(backoff).await;

                    base = match self.store.read().await {
                        Ok(handle) => handle,
                        Err(source) => {
                            self.clean_up(&written, &[]).await;
                            return Err(source).context(StoreSnafu);
                        }
                    };
                }
                Ok(CasOutcome::Unknown { reason }) => {
                    error!(
                        "Commit state unknown for snapshot {snapshot_id}: {reason}. Produced files are left in place"
                    );
                    return StateUnknownSnafu { reason }.fail();
                }
                Err(source) => {
                    self.clean_up(&written, &[]).await;
                    return Err(source).context(StoreSnafu);
                }
            }
        }
    }

    /// Delete manifests written by attempts other than the committed one.
    async fn clean_up(&self, written: &[String], committed: &[String]) {
        for location in written.iter().filter(|l| !committed.contains(l)) {
            if let Err(e) = delete_with_retry(self.io, location, false, self.cleanup_attempts).await
            {
                warn!("Failed to clean up uncommitted manifest {location}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::LocalFileIo;
    use crate::metadata_store::{CasFault, InMemoryMetadataStore};
    use crate::model::{DataFile, PartitionKey, TableMetadata};
    use crate::storage::TableLocation;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn fast_retry(num_retries: u32) -> CommitRetryPolicy {
        CommitRetryPolicy {
            num_retries,
            min_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(5),
            total_timeout: Duration::from_secs(30),
        }
    }

    fn append(path: &str) -> TableOperation {
        TableOperation::Append {
            files: vec![DataFile::data(path, PartitionKey::unpartitioned(), 1, 1)],
        }
    }

    async fn manifest_count(tmp: &TempDir) -> std::io::Result<usize> {
        let mut count = 0;
        let mut dir = tokio::fs::read_dir(tmp.path().join("metadata")).await?;
        while let Some(entry) = dir.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with("manifest-") {
                count += 1;
            }
        }
        Ok(count)
    }

    #[tokio::test]
    async fn conflict_is_retried_and_orphans_are_removed() -> TestResult {
        let tmp = TempDir::new()?;
        let io = LocalFileIo::new(TableLocation::local(tmp.path()));
        let store = InMemoryMetadataStore::new();
        let base = store
            .create(TableMetadata::new("t", BTreeMap::new()))
            .await?;
        store.inject_fault_at(1, CasFault::Conflict);

        let committer = SnapshotCommitter::new(&store, &io, fast_retry(4), 3);
        let outcome = committer.commit(base, &append("a")).await?;

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.sequence_number, 1);
        // The first attempt's manifest was deleted.
        assert_eq!(manifest_count(&tmp).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_retries_fail_with_known_state() -> TestResult {
        let tmp = TempDir::new()?;
        let io = LocalFileIo::new(TableLocation::local(tmp.path()));
        let store = InMemoryMetadataStore::new();
        let base = store
            .create(TableMetadata::new("t", BTreeMap::new()))
            .await?;
        for call in 1..=3 {
            store.inject_fault_at(call, CasFault::Conflict);
        }

        let committer = SnapshotCommitter::new(&store, &io, fast_retry(2), 3);
        let err = committer
            .commit(base, &append("a"))
            .await
            .expect_err("3 conflicts with 2 retries");

        assert!(matches!(err, CommitError::Failed { attempts: 3, .. }));
        assert!(err.is_cleanup_safe());
        assert_eq!(manifest_count(&tmp).await?, 0);
        assert_eq!(store.read().await?.version, 1);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_outcome_keeps_manifests() -> TestResult {
        let tmp = TempDir::new()?;
        let io = LocalFileIo::new(TableLocation::local(tmp.path()));
        let store = InMemoryMetadataStore::new();
        let base = store
            .create(TableMetadata::new("t", BTreeMap::new()))
            .await?;
        store.inject_next_fault(CasFault::UnknownAfterCommit);

        let committer = SnapshotCommitter::new(&store, &io, fast_retry(4), 3);
        let err = committer
            .commit(base, &append("a"))
            .await
            .expect_err("unknown outcome");

        assert!(err.is_state_unknown());
        assert!(!err.is_cleanup_safe());
        assert_eq!(manifest_count(&tmp).await?, 1);
        // The swap did happen, and the manifest it references is intact.
        assert_eq!(store.read().await?.version, 2);
        Ok(())
    }

    #[tokio::test]
    async fn store_failure_is_definite() -> TestResult {
        let tmp = TempDir::new()?;
        let io = LocalFileIo::new(TableLocation::local(tmp.path()));
        let store = InMemoryMetadataStore::new();
        let base = store
            .create(TableMetadata::new("t", BTreeMap::new()))
            .await?;
        store.inject_next_fault(CasFault::Unavailable);

        let committer = SnapshotCommitter::new(&store, &io, fast_retry(4), 3);
        let err = committer
            .commit(base, &append("a"))
            .await
            .expect_err("store unavailable");

        assert!(matches!(err, CommitError::Store { .. }));
        assert_eq!(manifest_count(&tmp).await?, 0);
        Ok(())
    }
}
