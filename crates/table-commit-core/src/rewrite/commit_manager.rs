//! Committing rewritten file groups.
use std::collections::HashSet;
use std::sync::Arc;

use log::{error, warn};
use snafu::prelude::*;

use crate::commit::{CommitOutcome, RewriteFiles, TableOperation};
use crate::model::DataFile;
use crate::rewrite::{CommitService, CommitSnafu, IllegalStateSnafu, RewriteError, RewriteFileGroup};
use crate::table::Table;

/// Commits groups of a rewrite that was planned against one starting snapshot.
#[derive(Debug, Clone)]
pub struct RewriteCommitManager {
    table: Arc<Table>,
    starting_snapshot_id: Option<i64>,
    use_starting_sequence_number: bool,
}

impl RewriteCommitManager {
    /// Manager for a rewrite planned against the table's current snapshot,
    /// using the table's sequence-number setting.
    pub fn new(table: Arc<Table>) -> Self {
        let starting_snapshot_id = table.current().current_snapshot_id();
        let use_starting_sequence_number = table.config().use_starting_sequence_number;
        Self::with_starting_snapshot(table, starting_snapshot_id, use_starting_sequence_number)
    }

    /// Manager for a rewrite planned against `starting_snapshot_id`.
    pub fn with_starting_snapshot(
        table: Arc<Table>,
        starting_snapshot_id: Option<i64>,
        use_starting_sequence_number: bool,
    ) -> Self {
        Self {
            table,
            starting_snapshot_id,
            use_starting_sequence_number,
        }
    }

    /// The table being rewritten.
    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    /// Snapshot the rewrite was planned against.
    pub fn starting_snapshot_id(&self) -> Option<i64> {
        self.starting_snapshot_id
    }

    /// Commit all `groups` as one replace operation.
    ///
    /// Every group must have been rewritten. The commit is validated against
    /// the starting snapshot, and with `use_starting_sequence_number` the
    /// added files keep the starting snapshot's sequence number.
    pub async fn commit_file_groups(
        &self,
        groups: &[RewriteFileGroup],
    ) -> Result<CommitOutcome, RewriteError> {
        let mut removed = Vec::new();
        let mut added = Vec::new();
        let mut seen_removed = HashSet::new();
        let mut seen_added = HashSet::new();
        for group in groups {
            push_unique(&mut removed, &mut seen_removed, group.rewritten_files());
            push_unique(&mut added, &mut seen_added, group.require_added_files()?);
        }

        let sequence_number = match self.starting_snapshot_id {
            Some(id) if self.use_starting_sequence_number => {
                let snapshot = self.table.snapshot(id).context(IllegalStateSnafu {
                    msg: format!("starting snapshot {id} is not known to the table"),
                })?;
                Some(snapshot.sequence_number)
            }
            _ => None,
        };

        let op = TableOperation::Rewrite(RewriteFiles {
            removed,
            added,
            sequence_number,
            validate_from: self.starting_snapshot_id,
        });
        self.table.commit(op).await.context(CommitSnafu)
    }

    /// Delete the files a group produced.
    ///
    /// Deletes are attempted once each; failures are logged and ignored.
    /// Fails only when the group has not been rewritten.
    pub async fn abort_file_group(&self, group: &RewriteFileGroup) -> Result<(), RewriteError> {
        let added = group.require_added_files()?;
        let io = self.table.io();
        for file in added {
            if let Err(e) = io.delete(&file.path, false).await {
                warn!("Failed to delete: {}: {e}", file.path);
            }
        }
        Ok(())
    }

    /// Commit `groups`; on a definite failure delete every group's output.
    ///
    /// When the commit state is unknown nothing is deleted, since the files
    /// may be referenced by the table.
    pub async fn commit_or_clean(
        &self,
        groups: &[RewriteFileGroup],
    ) -> Result<CommitOutcome, RewriteError> {
        match self.commit_file_groups(groups).await {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_state_unknown() => {
                error!(
                    "Commit state unknown for {} file groups, cannot clean up files because they may have been committed successfully: {err}",
                    groups.len()
                );
                Err(err)
            }
            Err(err) => {
                error!(
                    "Cannot commit {} file groups, attempting to clean up written files: {err}",
                    groups.len()
                );
                for group in groups {
                    if let Err(abort_err) = self.abort_file_group(group).await {
                        warn!("Skipping cleanup of file group {group}: {abort_err}");
                    }
                }
                Err(err)
            }
        }
    }

    /// A commit service committing `rewrites_per_commit` groups at a time.
    pub fn service(&self, rewrites_per_commit: usize) -> CommitService {
        let config = self.table.config().service;
        CommitService::new(self.clone(), rewrites_per_commit, config)
    }
}

fn push_unique(out: &mut Vec<DataFile>, seen: &mut HashSet<String>, files: &[DataFile]) {
    for file in files {
        if seen.insert(file.path.clone()) {
            out.push(file.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::FileGroupInfo;
    use crate::model::PartitionKey;
    use crate::storage::TableLocation;
    use bytes::Bytes;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn file(path: &str) -> DataFile {
        DataFile::data(path, PartitionKey::unpartitioned(), 1, 4)
    }

    fn group(index: usize, inputs: &[&str], outputs: Option<&[&str]>) -> RewriteFileGroup {
        let mut group = RewriteFileGroup::new(
            FileGroupInfo {
                global_index: index,
                partition_index: index,
                partition: PartitionKey::unpartitioned(),
            },
            inputs.iter().map(|p| file(p)).collect(),
        );
        if let Some(outputs) = outputs {
            group.set_output_files(outputs.iter().map(|p| file(p)).collect());
        }
        group
    }

    async fn table_with(tmp: &TempDir, paths: &[&str]) -> Result<Arc<Table>, Box<dyn std::error::Error>> {
        let table =
            Table::create_local("t", TableLocation::local(tmp.path()), BTreeMap::new()).await?;
        for path in paths {
            table.io().write(path, Bytes::from_static(b"PAR1")).await?;
        }
        table
            .commit(TableOperation::Append {
                files: paths.iter().map(|p| file(p)).collect(),
            })
            .await?;
        Ok(Arc::new(table))
    }

    #[tokio::test]
    async fn commit_file_groups_replaces_inputs() -> TestResult {
        let tmp = TempDir::new()?;
        let table = table_with(&tmp, &["data/a", "data/b", "data/c"]).await?;
        let manager = RewriteCommitManager::new(table.clone());

        manager
            .commit_file_groups(&[
                group(0, &["data/a", "data/b"], Some(&["data/ab"])),
                group(1, &["data/c"], Some(&["data/c2"])),
            ])
            .await?;

        let mut paths: Vec<String> = table
            .scan_files()
            .await?
            .files
            .into_iter()
            .map(|f| f.path)
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["data/ab", "data/c2"]);
        Ok(())
    }

    #[tokio::test]
    async fn abort_requires_rewritten_group_and_is_idempotent() -> TestResult {
        let tmp = TempDir::new()?;
        let table = table_with(&tmp, &["data/a"]).await?;
        table.io().write("data/a2", Bytes::from_static(b"PAR1")).await?;
        let manager = RewriteCommitManager::new(table.clone());

        let err = manager
            .abort_file_group(&group(0, &["data/a"], None))
            .await
            .expect_err("not rewritten");
        assert!(matches!(err, RewriteError::IllegalState { .. }));

        let rewritten = group(0, &["data/a"], Some(&["data/a2"]));
        manager.abort_file_group(&rewritten).await?;
        manager.abort_file_group(&rewritten).await?;
        assert!(!table.io().exists("data/a2").await?);
        Ok(())
    }

    #[tokio::test]
    async fn commit_or_clean_deletes_outputs_on_validation_failure() -> TestResult {
        let tmp = TempDir::new()?;
        let table = table_with(&tmp, &["data/a"]).await?;
        table.io().write("data/x2", Bytes::from_static(b"PAR1")).await?;
        let manager = RewriteCommitManager::new(table.clone());

        let err = manager
            .commit_or_clean(&[group(0, &["data/missing"], Some(&["data/x2"]))])
            .await
            .expect_err("input is not live");

        assert!(matches!(
            err,
            RewriteError::Commit {
                source: crate::commit::CommitError::Validation { .. }
            }
        ));
        assert!(!table.io().exists("data/x2").await?);
        Ok(())
    }
}
