//! Table handle.
//!
//! A [`Table`] pairs a [`MetadataStore`] with a [`FileIo`] and a
//! [`CommitConfig`]. It caches the last metadata it saw; commits start from
//! that cached base and the commit loop refreshes it on conflict, so a stale
//! handle is always safe to commit through.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use snafu::prelude::*;

use crate::commit::manifest_io::read_manifests;
use crate::commit::{CommitError, CommitOutcome, SnapshotCommitter, TableOperation};
use crate::config::{CommitConfig, ConfigError};
use crate::io::{FileIo, LocalFileIo};
use crate::metadata_store::{FileMetadataStore, MetadataHandle, MetadataStore, StoreError};
use crate::metrics::{ScanMetrics, ScanReport};
use crate::model::{DataFile, Snapshot, TableMetadata};
use crate::storage::TableLocation;

/// Errors from table-level operations other than commits.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TableError {
    /// The metadata store failed.
    #[snafu(display("Metadata store error: {source}"))]
    Store {
        /// Store error.
        #[snafu(backtrace)]
        source: StoreError,
    },

    /// Table properties hold an invalid engine setting.
    #[snafu(display("Invalid table configuration: {source}"))]
    Config {
        /// Config error.
        source: ConfigError,
    },

    /// Reading manifests for a scan failed.
    #[snafu(display("Failed to plan scan: {source}"))]
    Scan {
        /// Underlying error.
        #[snafu(backtrace)]
        source: CommitError,
    },
}

/// Live files of a snapshot plus the metrics of planning them.
#[derive(Debug, Clone)]
pub struct ScanResult {
    /// Live data and delete files.
    pub files: Vec<DataFile>,
    /// Planning metrics.
    pub report: ScanReport,
}

/// A table: metadata store, file I/O and engine configuration.
#[derive(Debug)]
pub struct Table {
    name: String,
    store: Arc<dyn MetadataStore>,
    io: Arc<dyn FileIo>,
    config: CommitConfig,
    current: Mutex<MetadataHandle>,
}

impl Table {
    /// Create a new table in `store` with `properties`.
    ///
    /// The engine configuration is read from the properties.
    pub async fn create(
        name: impl Into<String>,
        store: Arc<dyn MetadataStore>,
        io: Arc<dyn FileIo>,
        location: impl Into<String>,
        properties: BTreeMap<String, String>,
    ) -> Result<Self, TableError> {
        let config = CommitConfig::from_properties(&properties).context(ConfigSnafu)?;
        let handle = store
            .create(TableMetadata::new(location, properties))
            .await
            .context(StoreSnafu)?;
        Ok(Self::from_parts(name.into(), store, io, config, handle))
    }

    /// Load an existing table. The engine configuration comes from its
    /// properties.
    pub async fn load(
        name: impl Into<String>,
        store: Arc<dyn MetadataStore>,
        io: Arc<dyn FileIo>,
    ) -> Result<Self, TableError> {
        let handle = store.read().await.context(StoreSnafu)?;
        let config = CommitConfig::from_properties(&handle.metadata.properties)
            .context(ConfigSnafu)?;
        Ok(Self::from_parts(name.into(), store, io, config, handle))
    }

    /// Create a table stored under a local directory.
    pub async fn create_local(
        name: impl Into<String>,
        location: TableLocation,
        properties: BTreeMap<String, String>,
    ) -> Result<Self, TableError> {
        let display_root = location.display_root();
        Table::create(
            name,
            Arc::new(FileMetadataStore::new(location.clone())),
            Arc::new(LocalFileIo::new(location)),
            display_root,
            properties,
        )
        .await
    }

    /// Open a table stored under a local directory.
    pub async fn open_local(
        name: impl Into<String>,
        location: TableLocation,
    ) -> Result<Self, TableError> {
        Table::load(
            name,
            Arc::new(FileMetadataStore::new(location.clone())),
            Arc::new(LocalFileIo::new(location)),
        )
        .await
    }

    fn from_parts(
        name: String,
        store: Arc<dyn MetadataStore>,
        io: Arc<dyn FileIo>,
        config: CommitConfig,
        handle: MetadataHandle,
    ) -> Self {
        Self {
            name,
            store,
            io,
            config,
            current: Mutex::new(handle),
        }
    }

    /// Replace the engine configuration.
    pub fn with_config(mut self, config: CommitConfig) -> Self {
        self.config = config;
        self
    }

    /// Table name, used in reports and logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Engine configuration.
    pub fn config(&self) -> &CommitConfig {
        &self.config
    }

    /// File I/O of the table.
    pub fn io(&self) -> &Arc<dyn FileIo> {
        &self.io
    }

    fn cached(&self) -> MutexGuard<'_, MetadataHandle> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Metadata as of the last read or commit through this handle.
    pub fn current(&self) -> MetadataHandle {
        self.cached().clone()
    }

    /// Re-read the current metadata from the store.
    pub async fn refresh(&self) -> Result<MetadataHandle, TableError> {
        let handle = self.store.read().await.context(StoreSnafu)?;
        self.remember(&handle);
        Ok(handle)
    }

    fn remember(&self, handle: &MetadataHandle) {
        let mut cached = self.cached();
        if handle.version > cached.version {
            *cached = handle.clone();
        }
    }

    /// Look up a snapshot in the cached metadata.
    pub fn snapshot(&self, snapshot_id: i64) -> Option<Snapshot> {
        self.cached().metadata.snapshot(snapshot_id).cloned()
    }

    /// Commit `op` through the snapshot commit protocol.
    pub async fn commit(&self, op: TableOperation) -> Result<CommitOutcome, CommitError> {
        let committer = SnapshotCommitter::new(
            self.store.as_ref(),
            self.io.as_ref(),
            self.config.retry,
            self.config.cleanup_delete_attempts,
        );
        let outcome = committer.commit(self.current(), &op).await?;
        self.remember(&outcome.metadata);
        Ok(outcome)
    }

    /// List the live files of the current snapshot.
    ///
    /// Reads the latest metadata first.
    pub async fn scan_files(&self) -> Result<ScanResult, TableError> {
        let planning = Instant::now();
        let handle = self.refresh().await?;
        let metrics = ScanMetrics::new();

        let Some(snapshot) = handle.metadata.current_snapshot() else {
            metrics.total_planning_duration.record(planning.elapsed());
            return Ok(ScanResult {
                files: Vec::new(),
                report: ScanReport::new(&self.name, None, metrics.result()),
            });
        };

        let manifests = read_manifests(self.io.as_ref(), &snapshot.manifests)
            .await
            .context(ScanSnafu)?;

        let mut files = Vec::new();
        for (_, manifest) in &manifests {
            let live: Vec<&DataFile> = manifest.live_entries().map(|e| &e.file).collect();
            let has_deletes = live.iter().any(|f| f.is_delete_file());
            let has_data = live.iter().any(|f| !f.is_delete_file());

            if has_data {
                metrics.total_data_manifests.increment();
                metrics.scanned_data_manifests.increment();
            } else if !has_deletes {
                metrics.skipped_data_manifests.increment();
            }
            if has_deletes {
                metrics.total_delete_manifests.increment();
            }

            for file in live {
                if file.is_delete_file() {
                    metrics.result_delete_files.increment();
                    metrics
                        .total_delete_file_size_in_bytes
                        .increment_by(file.file_size_bytes);
                } else {
                    metrics.result_data_files.increment();
                    metrics.total_file_size_in_bytes.increment_by(file.file_size_bytes);
                }
                files.push(file.clone());
            }
        }

        metrics.total_planning_duration.record(planning.elapsed());
        Ok(ScanResult {
            files,
            report: ScanReport::new(&self.name, Some(snapshot.snapshot_id), metrics.result()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::RewriteFiles;
    use crate::config::COMMIT_NUM_RETRIES;
    use crate::model::PartitionKey;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn file(path: &str) -> DataFile {
        DataFile::data(path, PartitionKey::unpartitioned(), 10, 100)
    }

    #[tokio::test]
    async fn local_table_append_scan_and_reopen() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());
        let table = Table::create_local("events", location.clone(), BTreeMap::new()).await?;

        let outcome = table
            .commit(TableOperation::Append {
                files: vec![file("data/a.parquet"), file("data/b.parquet")],
            })
            .await?;
        assert_eq!(outcome.sequence_number, 1);

        let reopened = Table::open_local("events", location).await?;
        let scan = reopened.scan_files().await?;
        assert_eq!(scan.files.len(), 2);
        assert_eq!(scan.report.snapshot_id, Some(outcome.snapshot_id));
        let result_files = scan
            .report
            .metrics
            .result_data_files
            .as_ref()
            .map(|c| c.value);
        assert_eq!(result_files, Some(2));
        assert!(scan.report.metrics.total_planning_duration.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn scan_of_empty_table_has_no_snapshot() -> TestResult {
        let tmp = TempDir::new()?;
        let table =
            Table::create_local("empty", TableLocation::local(tmp.path()), BTreeMap::new()).await?;

        let scan = table.scan_files().await?;

        assert!(scan.files.is_empty());
        assert_eq!(scan.report.snapshot_id, None);
        let result_files = scan
            .report
            .metrics
            .result_data_files
            .as_ref()
            .map(|c| c.value);
        assert_eq!(result_files, Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn stale_handle_commits_on_top_of_newer_metadata() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());
        let writer_a = Table::create_local("t", location.clone(), BTreeMap::new()).await?;
        let writer_b = Table::open_local("t", location).await?;

        let first = writer_a
            .commit(TableOperation::Append {
                files: vec![file("data/a.parquet")],
            })
            .await?;
        let second = writer_b
            .commit(TableOperation::Append {
                files: vec![file("data/b.parquet")],
            })
            .await?;

        assert_eq!(first.sequence_number, 1);
        assert_eq!(second.sequence_number, 2);
        assert_eq!(second.attempts, 2);
        assert_eq!(writer_b.scan_files().await?.files.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_properties_are_rejected_on_create() -> TestResult {
        let tmp = TempDir::new()?;
        let props = BTreeMap::from([(COMMIT_NUM_RETRIES.to_string(), "-1".to_string())]);

        let err = Table::create_local("t", TableLocation::local(tmp.path()), props)
            .await
            .expect_err("negative retries");

        assert!(matches!(err, TableError::Config { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn rewrite_through_table_updates_scan() -> TestResult {
        let tmp = TempDir::new()?;
        let table =
            Table::create_local("t", TableLocation::local(tmp.path()), BTreeMap::new()).await?;
        let start = table
            .commit(TableOperation::Append {
                files: vec![file("data/a.parquet"), file("data/b.parquet")],
            })
            .await?;

        table
            .commit(TableOperation::Rewrite(RewriteFiles {
                removed: vec![file("data/a.parquet"), file("data/b.parquet")],
                added: vec![file("data/ab.parquet")],
                sequence_number: Some(start.sequence_number),
                validate_from: Some(start.snapshot_id),
            }))
            .await?;

        let paths: Vec<String> = table
            .scan_files()
            .await?
            .files
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(paths, vec!["data/ab.parquet"]);
        Ok(())
    }
}
