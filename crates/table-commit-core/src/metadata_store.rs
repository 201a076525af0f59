//! Metadata pointer with compare-and-swap semantics.
//!
//! The metadata store owns the single piece of mutable global state of a
//! table: which [`TableMetadata`] is current. Every change goes through
//! [`MetadataStore::compare_and_swap`], which installs the new value only if
//! the pointer still holds the caller's expected version.
//!
//! A CAS has three outcomes, and callers must keep them apart:
//!
//! - [`CasOutcome::Committed`]: the new metadata is current.
//! - [`CasOutcome::Conflict`]: another writer won; nothing of ours is
//!   visible and the caller may rebuild against the new base.
//! - [`CasOutcome::Unknown`]: the store cannot tell whether the swap took
//!   effect. Files referenced by the attempted metadata may be live and
//!   must not be cleaned up.
//!
//! An `Err(StoreError)` means the swap definitely did not happen (for
//! example, the current pointer could not even be read).

pub mod file_store;
pub mod in_memory;

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use snafu::{Backtrace, prelude::*};

use crate::{model::TableMetadata, storage::StorageError};

pub use file_store::FileMetadataStore;
pub use in_memory::{CasFault, InMemoryMetadataStore};

/// A resolved metadata pointer value plus the metadata it points to.
#[derive(Debug, Clone)]
pub struct MetadataHandle {
    /// Pointer version; the value compared by CAS.
    pub version: u64,
    /// Where the metadata document lives.
    pub metadata_location: String,
    /// The metadata itself.
    pub metadata: Arc<TableMetadata>,
}

impl MetadataHandle {
    /// Shorthand for the current snapshot id of the pointed-to metadata.
    pub fn current_snapshot_id(&self) -> Option<i64> {
        self.metadata.current_snapshot_id
    }
}

/// Result of a compare-and-swap attempt that reached the store.
#[derive(Debug, Clone)]
pub enum CasOutcome {
    /// The swap happened; the handle describes the new current value.
    Committed(MetadataHandle),
    /// The pointer moved since `expected` was read.
    Conflict {
        /// Version the caller expected.
        expected: u64,
        /// Version found in the store.
        found: u64,
    },
    /// The swap may or may not have happened.
    Unknown {
        /// Why the outcome could not be determined.
        reason: String,
    },
}

/// Errors from the metadata store. All of them leave the pointer unchanged.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// Underlying storage failure.
    #[snafu(display("Storage error while accessing table metadata: {source}"))]
    Storage {
        /// Storage error returned by the backend.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// The pointer or a metadata document is malformed.
    #[snafu(display("Corrupt metadata state: {msg}"))]
    CorruptState {
        /// Description of the corrupt state.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// `create` was called on a table that already has metadata.
    #[snafu(display("Table already exists at metadata version {version}"))]
    TableExists {
        /// Current pointer version.
        version: u64,
    },

    /// `read` was called on a location without any metadata.
    #[snafu(display("No table metadata found"))]
    NoTable,

    /// The store refused the request before touching the pointer.
    #[snafu(display("Metadata store unavailable: {msg}"))]
    Unavailable {
        /// Reason reported by the store.
        msg: String,
    },
}

/// Atomic, versioned pointer to the current table metadata.
#[async_trait]
pub trait MetadataStore: Send + Sync + Debug {
    /// Install the first metadata of a table (pointer version 1).
    async fn create(&self, metadata: TableMetadata) -> Result<MetadataHandle, StoreError>;

    /// Read the current pointer value and metadata.
    async fn read(&self) -> Result<MetadataHandle, StoreError>;

    /// Install `next` if the pointer still holds `expected.version`.
    async fn compare_and_swap(
        &self,
        expected: &MetadataHandle,
        next: TableMetadata,
    ) -> Result<CasOutcome, StoreError>;
}
