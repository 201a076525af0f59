//! Commit-file codec and locations.
//!
//! A commit file is written once by its task and read at most once by the
//! coordinator, with bincode in its standard configuration as the encoding.
//! The descriptors are encoded through a dedicated record type because
//! bincode is not self-describing and cannot honor the optional-field
//! elision used by the JSON manifests.
use std::collections::BTreeMap;

use backon::Retryable;
use bytes::Bytes;
use futures::{StreamExt, stream};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::exchange::{DecodeSnafu, EncodeSnafu, ExchangeError, StorageSnafu, TaskMismatchSnafu};
use crate::io::{FileIo, transient_retry_policy};
use crate::model::{ColumnMetrics, DataFile, FileContent, FileFormat, PartitionKey};

const TEMP_DIR_NAME: &str = "temp";
const COMMIT_FILE_SUFFIX: &str = ".forCommit";

/// Identifies one write job of one query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobContext {
    /// Query the job belongs to.
    pub query_id: String,
    /// Job id, unique within the query.
    pub job_id: String,
}

impl JobContext {
    /// Context for `job_id` of `query_id`.
    pub fn new(query_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            job_id: job_id.into(),
        }
    }

    /// Directory holding the job's commit files, relative to the table root.
    pub fn temp_dir(&self) -> String {
        format!("{TEMP_DIR_NAME}/{}-{}", self.query_id, self.job_id)
    }

    /// Location of the commit file of `task_id`.
    pub fn commit_file_path(&self, task_id: u64) -> String {
        format!("{}/task-{task_id}{COMMIT_FILE_SUFFIX}", self.temp_dir())
    }
}

#[derive(Serialize, Deserialize)]
struct CommitFileRecord {
    task_id: u64,
    files: Vec<FileRecord>,
}

#[derive(Serialize, Deserialize)]
struct FileRecord {
    path: String,
    content: FileContent,
    format: FileFormat,
    partition: BTreeMap<String, String>,
    record_count: u64,
    file_size_bytes: u64,
    value_counts: BTreeMap<i32, u64>,
    null_value_counts: BTreeMap<i32, u64>,
    lower_bounds: BTreeMap<i32, Vec<u8>>,
    upper_bounds: BTreeMap<i32, Vec<u8>>,
}

impl From<&DataFile> for FileRecord {
    fn from(file: &DataFile) -> Self {
        Self {
            path: file.path.clone(),
            content: file.content,
            format: file.format,
            partition: file.partition.0.clone(),
            record_count: file.record_count,
            file_size_bytes: file.file_size_bytes,
            value_counts: file.metrics.value_counts.clone(),
            null_value_counts: file.metrics.null_value_counts.clone(),
            lower_bounds: file.metrics.lower_bounds.clone(),
            upper_bounds: file.metrics.upper_bounds.clone(),
        }
    }
}

impl From<FileRecord> for DataFile {
    fn from(record: FileRecord) -> Self {
        DataFile {
            path: record.path,
            content: record.content,
            format: record.format,
            partition: PartitionKey(record.partition),
            record_count: record.record_count,
            file_size_bytes: record.file_size_bytes,
            metrics: ColumnMetrics {
                value_counts: record.value_counts,
                null_value_counts: record.null_value_counts,
                lower_bounds: record.lower_bounds,
                upper_bounds: record.upper_bounds,
            },
        }
    }
}

/// Record the files `task_id` produced. Returns the commit file location.
///
/// A re-attempted task replaces the commit file of the earlier attempt.
pub async fn write_commit_file(
    io: &dyn FileIo,
    job: &JobContext,
    task_id: u64,
    files: &[DataFile],
) -> Result<String, ExchangeError> {
    let path = job.commit_file_path(task_id);
    let record = CommitFileRecord {
        task_id,
        files: files.iter().map(FileRecord::from).collect(),
    };
    let bytes = bincode::serde::encode_to_vec(&record, bincode::config::standard())
        .context(EncodeSnafu { path: path.clone() })?;

    io.write(&path, Bytes::from(bytes))
        .await
        .context(StorageSnafu { path: path.clone() })?;
    debug!("Wrote commit file {path} with {} files", files.len());
    Ok(path)
}

/// Read the commit file of `task_id` once, without retries.
pub async fn read_commit_file(
    io: &dyn FileIo,
    job: &JobContext,
    task_id: u64,
) -> Result<Vec<DataFile>, ExchangeError> {
    let path = job.commit_file_path(task_id);
    let bytes = io
        .read(&path)
        .await
        .context(StorageSnafu { path: path.clone() })?;

    let (record, _): (CommitFileRecord, usize) =
        bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .context(DecodeSnafu { path: path.clone() })?;
    ensure!(
        record.task_id == task_id,
        TaskMismatchSnafu {
            path,
            expected: task_id,
            found: record.task_id,
        }
    );
    Ok(record.files.into_iter().map(DataFile::from).collect())
}

/// Read the commit files of tasks `0..expected_tasks`.
///
/// At most `pool_size` files are read at once and every read is tried up to
/// `attempts` times. Files are returned in task order. With
/// `throw_on_failure` unset, unreadable commit files are logged and skipped.
pub async fn read_commit_files(
    io: &dyn FileIo,
    job: &JobContext,
    expected_tasks: u64,
    pool_size: usize,
    attempts: usize,
    throw_on_failure: bool,
) -> Result<Vec<DataFile>, ExchangeError> {
    let mut reads = stream::iter(0..expected_tasks)
        .map(|task_id| async move {
            (|| async move { read_commit_file(io, job, task_id).await })
                .retry(transient_retry_policy(attempts))
                .notify(|err, dur| {
                    warn!(
                        "Failed to read commit file of task {task_id}: {err}. Retrying in {:.1}s",
                        dur.as_secs_f32()
                    );
                })
                .await
        })
        .buffered(pool_size.max(1));

    let mut files = Vec::new();
    while let Some(read) = reads.next().await {
        match read {
            Ok(task_files) => files.extend(task_files),
            Err(err) if throw_on_failure => return Err(err),
            Err(err) => warn!("Skipping unreadable commit file: {err}"),
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::LocalFileIo;
    use crate::storage::TableLocation;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn file(path: &str) -> DataFile {
        let mut metrics = ColumnMetrics::default();
        metrics.value_counts.insert(1, 10);
        metrics.lower_bounds.insert(1, vec![0, 1]);
        DataFile::data(path, PartitionKey::from_pairs([("day", "2024-01-01")]), 10, 512)
            .with_metrics(metrics)
    }

    #[test]
    fn locations_derive_from_job_and_task() {
        let job = JobContext::new("q1", "j7");
        assert_eq!(job.temp_dir(), "temp/q1-j7");
        assert_eq!(job.commit_file_path(3), "temp/q1-j7/task-3.forCommit");
    }

    #[tokio::test]
    async fn commit_file_keeps_descriptors_intact() -> TestResult {
        let tmp = TempDir::new()?;
        let io = LocalFileIo::new(TableLocation::local(tmp.path()));
        let job = JobContext::new("q", "j");
        let files = vec![file("data/a.parquet"), DataFile::data("data/b.parquet", PartitionKey::unpartitioned(), 1, 8)];

        write_commit_file(&io, &job, 0, &files).await?;

        assert_eq!(read_commit_file(&io, &job, 0).await?, files);
        Ok(())
    }

    #[tokio::test]
    async fn missing_commit_file_is_fatal_only_when_strict() -> TestResult {
        let tmp = TempDir::new()?;
        let io = LocalFileIo::new(TableLocation::local(tmp.path()));
        let job = JobContext::new("q", "j");
        write_commit_file(&io, &job, 0, &[file("data/a.parquet")]).await?;
        write_commit_file(&io, &job, 2, &[file("data/c.parquet")]).await?;

        let err = read_commit_files(&io, &job, 3, 2, 2, true)
            .await
            .expect_err("task 1 never wrote");
        assert!(matches!(err, ExchangeError::Storage { ref source, .. } if source.is_not_found()));

        let files = read_commit_files(&io, &job, 3, 2, 2, false).await?;
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["data/a.parquet", "data/c.parquet"]);
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_commit_file_is_rejected() -> TestResult {
        let tmp = TempDir::new()?;
        let io = LocalFileIo::new(TableLocation::local(tmp.path()));
        let job = JobContext::new("q", "j");
        io.write(&job.commit_file_path(0), Bytes::from_static(b"\xfd\x01"))
            .await?;

        let err = read_commit_file(&io, &job, 0)
            .await
            .expect_err("garbage");
        assert!(matches!(err, ExchangeError::Decode { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn commit_file_under_wrong_name_is_rejected() -> TestResult {
        let tmp = TempDir::new()?;
        let io = LocalFileIo::new(TableLocation::local(tmp.path()));
        let job = JobContext::new("q", "j");
        write_commit_file(&io, &job, 4, &[file("data/a.parquet")]).await?;
        let bytes = io.read(&job.commit_file_path(4)).await?;
        io.write(&job.commit_file_path(1), bytes).await?;

        let err = read_commit_file(&io, &job, 1)
            .await
            .expect_err("task id differs");
        assert!(matches!(
            err,
            ExchangeError::TaskMismatch {
                expected: 1,
                found: 4,
                ..
            }
        ));
        Ok(())
    }
}
