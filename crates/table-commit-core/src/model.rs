//! Metadata model.
//!
//! Pure data types only: data file descriptors, manifests, snapshots and
//! table metadata. Anything that touches storage lives in `metadata_store`,
//! `commit` or `exchange`.

pub mod data_file;
pub mod manifest;
pub mod snapshot;
pub mod table_metadata;

pub use data_file::{ColumnMetrics, DataFile, FileContent, FileFormat, PartitionKey};
pub use manifest::{EntryStatus, Manifest, ManifestEntry};
pub use snapshot::{Operation, Snapshot, SnapshotSummary};
pub use table_metadata::{SnapshotLogEntry, TableMetadata, TableMetadataError};
