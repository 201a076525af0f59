//! Filesystem layout and low-level storage primitives.
//!
//! This module is the only place that touches the local filesystem. Higher
//! layers (`io`, `metadata_store`, `exchange`) work with a [`TableLocation`]
//! plus *relative* paths and never build absolute paths themselves.
//!
//! Primitives provided here:
//!
//! - [`write_atomic`]: write-then-rename replacement, used for pointer files
//!   and artifacts that may be overwritten (for example, commit files of a
//!   re-attempted task).
//! - [`publish_new`]: fully write a temporary file and then link it into
//!   place only if the target does not exist yet. This is the linearization
//!   point of a metadata compare-and-swap.
//! - [`read_all_bytes`] / [`read_to_string`] / [`exists`].
//! - [`delete_file`] / [`delete_dir_all`]: idempotent deletes that report
//!   whether anything was removed.
//!
//! Only the local filesystem is supported, but every function dispatches on
//! [`TableLocation`] so that object-store backends can be added without
//! touching callers.

use snafu::{Backtrace, prelude::*};
use std::{
    error::Error,
    fmt, io,
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncWriteExt};

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Represents the root location of a table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TableLocation {
    /// A table stored on the local filesystem at the given path.
    Local(PathBuf),
}

impl TableLocation {
    /// Creates a new `TableLocation` for a local filesystem path.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        TableLocation::Local(root.into())
    }

    /// Human-readable form of the root, used in metadata and log lines.
    pub fn display_root(&self) -> String {
        match self {
            TableLocation::Local(root) => root.display().to_string(),
        }
    }
}

/// Error raised by the backend behind a [`TableLocation`].
#[derive(Debug)]
pub enum BackendError {
    /// Local filesystem.
    Local(io::Error),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Local(e) => write!(f, "{e}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BackendError::Local(e) => Some(e),
        }
    }
}

/// Storage failure, classified by what the caller may want to react to.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// Nothing exists at the path.
    #[snafu(display("Path not found: {path}"))]
    NotFound {
        /// Absolute path.
        path: String,
        /// Backend error.
        source: BackendError,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A create-new publish lost to an existing file.
    #[snafu(display("Path already exists: {path}"))]
    AlreadyExists {
        /// Absolute path.
        path: String,
        /// Backend error.
        source: BackendError,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Any other failure.
    #[snafu(display("I/O error at {path}: {source}"))]
    OtherIo {
        /// Absolute path.
        path: String,
        /// Backend error.
        source: BackendError,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

impl StorageError {
    /// The path the failed operation was working on.
    pub fn path(&self) -> &str {
        match self {
            StorageError::NotFound { path, .. }
            | StorageError::AlreadyExists { path, .. }
            | StorageError::OtherIo { path, .. } => path,
        }
    }

    /// Whether this error means the path does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

fn join_local(location: &TableLocation, rel: &Path) -> PathBuf {
    match location {
        TableLocation::Local(root) => root.join(rel),
    }
}

fn classify(err: io::Error, path: &Path) -> StorageError {
    let path = path.display().to_string();
    let backtrace = Backtrace::capture();
    match err.kind() {
        io::ErrorKind::NotFound => StorageError::NotFound {
            path,
            source: BackendError::Local(err),
            backtrace,
        },
        io::ErrorKind::AlreadyExists => StorageError::AlreadyExists {
            path,
            source: BackendError::Local(err),
            backtrace,
        },
        _ => StorageError::OtherIo {
            path,
            source: BackendError::Local(err),
            backtrace,
        },
    }
}

async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: parent.display().to_string(),
            })?;
    }
    Ok(())
}

/// Unique sibling path used for staging writes next to `abs`.
fn staging_path(abs: &Path) -> PathBuf {
    let file_name = abs
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    abs.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()))
}

/// Removes a staging file when dropped, unless disarmed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

async fn write_and_sync(path: &Path, contents: &[u8]) -> StorageResult<()> {
    let mut file = fs::File::create(path)
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: path.display().to_string(),
        })?;

    file.write_all(contents)
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: path.display().to_string(),
        })?;

    file.sync_all()
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: path.display().to_string(),
        })?;

    Ok(())
}

/// Write `contents` to `rel_path` inside `location`, replacing any existing
/// file atomically (write to a staging file, sync, rename into place).
pub async fn write_atomic(
    location: &TableLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    match location {
        TableLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            create_parent_dir(&abs).await?;

            let tmp_path = staging_path(&abs);
            let mut guard = TempFileGuard::new(tmp_path.clone());

            write_and_sync(&tmp_path, contents).await?;

            fs::rename(&tmp_path, &abs)
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: abs.display().to_string(),
                })?;

            guard.disarm();
            Ok(())
        }
    }
}

/// Publish `contents` at `rel_path` only if nothing exists there yet.
///
/// The payload is fully written and synced to a staging file first, then
/// hard-linked to the target. Linking fails atomically when the target
/// exists, so readers never observe a partially written file and at most
/// one publisher wins.
///
/// Errors:
/// - `StorageError::AlreadyExists` when another writer published first.
/// - `StorageError::OtherIo` for any other failure. The staging file is
///   removed in every case.
pub async fn publish_new(
    location: &TableLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    match location {
        TableLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            create_parent_dir(&abs).await?;

            let tmp_path = staging_path(&abs);
            // The guard always fires: after a successful link the staging
            // name is just a second reference to the published inode.
            let _guard = TempFileGuard::new(tmp_path.clone());

            write_and_sync(&tmp_path, contents).await?;

            match fs::hard_link(&tmp_path, &abs).await {
                Ok(()) => Ok(()),
                Err(e) => Err(classify(e, &abs)),
            }
        }
    }
}

/// Read the file at `rel_path` and return its contents as bytes.
///
/// Missing files map to `StorageError::NotFound`.
pub async fn read_all_bytes(location: &TableLocation, rel_path: &Path) -> StorageResult<Vec<u8>> {
    match location {
        TableLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            fs::read(&abs).await.map_err(|e| classify(e, &abs))
        }
    }
}

/// Read the file at `rel_path` and return its contents as a `String`.
pub async fn read_to_string(location: &TableLocation, rel_path: &Path) -> StorageResult<String> {
    match location {
        TableLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            fs::read_to_string(&abs)
                .await
                .map_err(|e| classify(e, &abs))
        }
    }
}

/// Whether anything exists at `rel_path`.
pub async fn exists(location: &TableLocation, rel_path: &Path) -> StorageResult<bool> {
    match location {
        TableLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            fs::try_exists(&abs)
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: abs.display().to_string(),
                })
        }
    }
}

/// Delete a single file. Returns `false` when the file did not exist.
pub async fn delete_file(location: &TableLocation, rel_path: &Path) -> StorageResult<bool> {
    match location {
        TableLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            match fs::remove_file(&abs).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(classify(e, &abs)),
            }
        }
    }
}

/// Delete a directory and everything below it. Returns `false` when the
/// directory did not exist.
pub async fn delete_dir_all(location: &TableLocation, rel_path: &Path) -> StorageResult<bool> {
    match location {
        TableLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            match fs::remove_dir_all(&abs).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(classify(e, &abs)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn write_atomic_creates_parent_directories() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());

        let rel_path = Path::new("nested/deep/dir/file.txt");
        write_atomic(&location, rel_path, b"nested content").await?;

        let read_back = tokio::fs::read_to_string(tmp.path().join(rel_path)).await?;
        assert_eq!(read_back, "nested content");
        Ok(())
    }

    #[tokio::test]
    async fn write_atomic_overwrites_and_leaves_no_staging_file() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());
        let rel_path = Path::new("overwrite.txt");

        write_atomic(&location, rel_path, b"original").await?;
        write_atomic(&location, rel_path, b"updated").await?;

        assert_eq!(read_to_string(&location, rel_path).await?, "updated");

        let mut entries = tokio::fs::read_dir(tmp.path()).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["overwrite.txt".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn publish_new_fails_if_target_exists() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());
        let rel_path = Path::new("meta/v1.json");

        publish_new(&location, rel_path, b"first").await?;
        let err = publish_new(&location, rel_path, b"second")
            .await
            .expect_err("second publish must lose");

        assert!(matches!(err, StorageError::AlreadyExists { .. }));
        assert_eq!(read_to_string(&location, rel_path).await?, "first");

        let mut entries = tokio::fs::read_dir(tmp.path().join("meta")).await?;
        let mut count = 0;
        while entries.next_entry().await?.is_some() {
            count += 1;
        }
        assert_eq!(count, 1, "staging files must be cleaned up");
        Ok(())
    }

    #[tokio::test]
    async fn read_returns_not_found_for_missing_file() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());

        let err = read_all_bytes(&location, Path::new("missing.bin"))
            .await
            .expect_err("expected NotFound error");
        assert!(err.is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn delete_file_is_idempotent() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());
        let rel_path = Path::new("data/a.parquet");

        write_atomic(&location, rel_path, b"PAR1").await?;

        assert!(delete_file(&location, rel_path).await?);
        assert!(!delete_file(&location, rel_path).await?);
        assert!(!exists(&location, rel_path).await?);
        Ok(())
    }

    #[tokio::test]
    async fn delete_dir_all_removes_nested_content() -> TestResult {
        let tmp = TempDir::new()?;
        let location = TableLocation::local(tmp.path());

        write_atomic(&location, Path::new("temp/job/task-0.forCommit"), b"x").await?;
        write_atomic(&location, Path::new("temp/job/task-1.forCommit"), b"y").await?;

        assert!(delete_dir_all(&location, Path::new("temp/job")).await?);
        assert!(!exists(&location, Path::new("temp/job")).await?);
        assert!(!delete_dir_all(&location, Path::new("temp/job")).await?);
        Ok(())
    }
}
