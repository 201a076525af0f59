//! Metadata store backed by versioned JSON files under the table root.
//!
//! Layout:
//!
//! ```text
//! table_root/
//!   metadata/
//!     CURRENT                        # hint: latest known version (e.g. "3\n")
//!     v0000000001.metadata.json      # pointer version 1
//!     v0000000002.metadata.json      # pointer version 2
//!     v0000000003.metadata.json      # pointer version 3
//! ```
//!
//! The compare-and-swap is the atomic *publication* of
//! `v<expected + 1>.metadata.json` (see [`storage::publish_new`]): at most one
//! writer can create a given version file. `CURRENT` is only a hint. Readers
//! start from it and roll forward while the next version file exists, so a
//! crash between publishing a version and updating `CURRENT` loses nothing.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use snafu::{Backtrace, prelude::*};

use crate::metadata_store::{
    CasOutcome, CorruptStateSnafu, MetadataHandle, MetadataStore, StorageSnafu, StoreError,
};
use crate::model::TableMetadata;
use crate::storage::{self, StorageError, TableLocation};

/// File-based [`MetadataStore`] rooted at a table directory.
#[derive(Debug, Clone)]
pub struct FileMetadataStore {
    location: TableLocation,
}

impl FileMetadataStore {
    /// Name of the subdirectory containing metadata versions.
    pub const METADATA_DIR_NAME: &str = "metadata";
    /// Name of the file that stores the version hint.
    pub const CURRENT_FILE_NAME: &str = "CURRENT";
    /// Number of digits used in zero-padded version file names.
    pub const VERSION_FILENAME_DIGITS: usize = 10;

    /// Create a store rooted at a table directory.
    pub fn new(location: TableLocation) -> Self {
        Self { location }
    }

    /// The table root of this store.
    pub fn location(&self) -> &TableLocation {
        &self.location
    }

    fn current_rel_path() -> PathBuf {
        PathBuf::from(Self::METADATA_DIR_NAME).join(Self::CURRENT_FILE_NAME)
    }

    /// Relative path of the metadata document for `version`.
    pub fn metadata_rel_path(version: u64) -> PathBuf {
        let file_name = format!(
            "v{:0width$}.metadata.json",
            version,
            width = Self::VERSION_FILENAME_DIGITS
        );
        PathBuf::from(Self::METADATA_DIR_NAME).join(file_name)
    }

    /// Load the CURRENT hint.
    ///
    /// - Missing file: fresh table, returns 0.
    /// - Empty or non-numeric content: `CorruptState`.
    pub async fn load_current_hint(&self) -> Result<u64, StoreError> {
        let rel = Self::current_rel_path();

        let contents = match storage::read_to_string(&self.location, &rel).await {
            Ok(s) => s,
            Err(StorageError::NotFound { .. }) => return Ok(0),
            Err(source) => return Err(StoreError::Storage { source }),
        };

        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return CorruptStateSnafu {
                msg: format!("CURRENT has empty content at {rel:?}"),
            }
            .fail();
        }

        trimmed.parse::<u64>().map_err(|e| StoreError::CorruptState {
            msg: format!("CURRENT has invalid content {trimmed:?}: {e}"),
            backtrace: Backtrace::capture(),
        })
    }

    /// Latest published version: the hint, rolled forward over any version
    /// files published after it.
    pub async fn resolve_latest_version(&self) -> Result<u64, StoreError> {
        let mut version = self.load_current_hint().await?;
        loop {
            let next = Self::metadata_rel_path(version + 1);
            let exists = storage::exists(&self.location, &next)
                .await
                .context(StorageSnafu)?;
            if !exists {
                return Ok(version);
            }
            version += 1;
        }
    }

    async fn load_metadata(&self, version: u64) -> Result<MetadataHandle, StoreError> {
        let rel = Self::metadata_rel_path(version);
        let json = storage::read_to_string(&self.location, &rel)
            .await
            .context(StorageSnafu)?;

        let metadata: TableMetadata =
            serde_json::from_str(&json).map_err(|e| StoreError::CorruptState {
                msg: format!("failed to parse metadata version {version}: {e}"),
                backtrace: Backtrace::capture(),
            })?;

        Ok(handle(version, &rel, metadata))
    }

    fn encode(metadata: &TableMetadata) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec_pretty(metadata).map_err(|e| StoreError::CorruptState {
            msg: format!("failed to serialize table metadata: {e}"),
            backtrace: Backtrace::capture(),
        })
    }

    /// Best-effort hint update. Readers roll forward, so failure is harmless.
    async fn write_hint(&self, version: u64) {
        let rel = Self::current_rel_path();
        if let Err(e) =
            storage::write_atomic(&self.location, &rel, format!("{version}\n").as_bytes()).await
        {
            warn!("Failed to update CURRENT hint to version {version}: {e}");
        }
    }

    /// Decide the outcome of a publish that failed with an unexpected error.
    ///
    /// The version file either exists with our bytes (we won), exists with
    /// other bytes (someone else won), or does not exist (nothing happened).
    /// If even that cannot be determined, the outcome is unknown.
    async fn resolve_ambiguous_publish(
        &self,
        rel: &Path,
        expected: u64,
        ours: &[u8],
        publish_err: StorageError,
        next: TableMetadata,
    ) -> Result<CasOutcome, StoreError> {
        match storage::read_all_bytes(&self.location, rel).await {
            Ok(bytes) if bytes == ours => {
                self.write_hint(expected + 1).await;
                Ok(CasOutcome::Committed(handle(expected + 1, rel, next)))
            }
            Ok(_) => Ok(CasOutcome::Conflict {
                expected,
                found: expected + 1,
            }),
            Err(StorageError::NotFound { .. }) => Err(StoreError::Storage {
                source: publish_err,
            }),
            Err(check_err) => Ok(CasOutcome::Unknown {
                reason: format!(
                    "publishing {} failed ({publish_err}) and its state could not be checked: {check_err}",
                    rel.display()
                ),
            }),
        }
    }
}

fn handle(version: u64, rel: &Path, metadata: TableMetadata) -> MetadataHandle {
    MetadataHandle {
        version,
        metadata_location: rel.display().to_string(),
        metadata: Arc::new(metadata),
    }
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    async fn create(&self, metadata: TableMetadata) -> Result<MetadataHandle, StoreError> {
        let latest = self.resolve_latest_version().await?;
        if latest != 0 {
            return Err(StoreError::TableExists { version: latest });
        }

        let rel = Self::metadata_rel_path(1);
        let json = Self::encode(&metadata)?;
        match storage::publish_new(&self.location, &rel, &json).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists { .. }) => {
                return Err(StoreError::TableExists { version: 1 });
            }
            Err(source) => return Err(StoreError::Storage { source }),
        }

        self.write_hint(1).await;
        Ok(handle(1, &rel, metadata))
    }

    async fn read(&self) -> Result<MetadataHandle, StoreError> {
        let version = self.resolve_latest_version().await?;
        if version == 0 {
            return Err(StoreError::NoTable);
        }
        self.load_metadata(version).await
    }

    /// Publish `v<expected + 1>` if the latest version is still `expected`.
    ///
    /// ## Steps
    ///
    /// 1. Resolve the latest version (hint + roll forward).
    /// 2. If it differs from `expected.version`, report `Conflict`.
    /// 3. Serialize `next` and publish it create-only-if-absent. Losing that
    ///    race is also a `Conflict`.
    /// 4. Update the CURRENT hint.
    async fn compare_and_swap(
        &self,
        expected: &MetadataHandle,
        next: TableMetadata,
    ) -> Result<CasOutcome, StoreError> {
        let latest = self.resolve_latest_version().await?;
        if latest != expected.version {
            return Ok(CasOutcome::Conflict {
                expected: expected.version,
                found: latest,
            });
        }

        let version = expected
            .version
            .checked_add(1)
            .context(CorruptStateSnafu {
                msg: "metadata version counter overflow".to_string(),
            })?;
        let rel = Self::metadata_rel_path(version);
        let json = Self::encode(&next)?;

        match storage::publish_new(&self.location, &rel, &json).await {
            Ok(()) => {
                debug!("Published table metadata version {version} at {}", rel.display());
                self.write_hint(version).await;
                Ok(CasOutcome::Committed(handle(version, &rel, next)))
            }
            Err(StorageError::AlreadyExists { .. }) => Ok(CasOutcome::Conflict {
                expected: expected.version,
                found: version,
            }),
            Err(publish_err) => {
                self.resolve_ambiguous_publish(&rel, expected.version, &json, publish_err, next)
                    .await
            }
        }
    }
}
