//! File I/O contract used by the commit engine.
//!
//! Data files, manifests and commit-file artifacts are all addressed by a
//! path relative to the table root. The [`FileIo`] trait is the seam the
//! engine calls through; [`LocalFileIo`] implements it over
//! [`crate::storage`]. Tests wrap it to inject failures or count deletes.

use std::{fmt::Debug, path::Path, time::Duration};

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use bytes::Bytes;
use log::warn;

use crate::storage::{self, StorageResult, TableLocation};

/// Filesystem operations needed by the engine.
///
/// Deletes are idempotent: removing a path that does not exist returns
/// `Ok(false)` rather than an error.
#[async_trait]
pub trait FileIo: Send + Sync + Debug {
    /// Create or replace the file at `path` with `contents`.
    async fn write(&self, path: &str, contents: Bytes) -> StorageResult<()>;

    /// Read the whole file at `path`.
    async fn read(&self, path: &str) -> StorageResult<Bytes>;

    /// Delete a file, or a directory tree when `recursive` is set.
    async fn delete(&self, path: &str, recursive: bool) -> StorageResult<bool>;

    /// Whether anything exists at `path`.
    async fn exists(&self, path: &str) -> StorageResult<bool>;
}

/// [`FileIo`] backed by the local filesystem under a table root.
#[derive(Debug, Clone)]
pub struct LocalFileIo {
    location: TableLocation,
}

impl LocalFileIo {
    /// Create a new local I/O handle rooted at `location`.
    pub fn new(location: TableLocation) -> Self {
        Self { location }
    }

    /// The table root this handle resolves paths against.
    pub fn location(&self) -> &TableLocation {
        &self.location
    }
}

#[async_trait]
impl FileIo for LocalFileIo {
    async fn write(&self, path: &str, contents: Bytes) -> StorageResult<()> {
        storage::write_atomic(&self.location, Path::new(path), &contents).await
    }

    async fn read(&self, path: &str) -> StorageResult<Bytes> {
        storage::read_all_bytes(&self.location, Path::new(path))
            .await
            .map(Bytes::from)
    }

    async fn delete(&self, path: &str, recursive: bool) -> StorageResult<bool> {
        if recursive {
            storage::delete_dir_all(&self.location, Path::new(path)).await
        } else {
            storage::delete_file(&self.location, Path::new(path)).await
        }
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        storage::exists(&self.location, Path::new(path)).await
    }
}

/// Backoff used for transient I/O retries (deletes, commit-file reads).
pub(crate) fn transient_retry_policy(attempts: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(attempts.saturating_sub(1))
}

/// Delete `path`, retrying transient failures up to `attempts` total tries.
///
/// The last error is returned to the caller, which decides whether to
/// suppress it (cleanup paths) or propagate it.
pub async fn delete_with_retry(
    io: &dyn FileIo,
    path: &str,
    recursive: bool,
    attempts: usize,
) -> StorageResult<bool> {
    (|| async move { io.delete(path, recursive).await })
        .retry(transient_retry_policy(attempts))
        .notify(|err, dur| {
            warn!(
                "Failed to delete {path}: {err}. Retrying in {:.1}s",
                dur.as_secs_f32()
            );
        })
        .await
}
