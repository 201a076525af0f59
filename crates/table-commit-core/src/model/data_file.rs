//! Data file descriptors recorded in manifests.
//!
//! This module contains **pure** data types. A [`DataFile`] is produced by an
//! external writer and is immutable once created; the engine only moves
//! references to it between snapshots.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

/// What kind of rows a file carries.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum FileContent {
    /// Regular table rows.
    #[default]
    Data,
    /// Deletes addressed by (file path, row position).
    PositionDeletes,
    /// Deletes addressed by column values.
    EqualityDeletes,
}

/// On-disk encoding of a file. The engine never decodes files itself.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// Apache Parquet.
    #[default]
    Parquet,
    /// Apache Avro.
    Avro,
    /// Apache ORC.
    Orc,
}

/// Partition tuple of a file, as `field -> value` pairs.
///
/// Unpartitioned tables use the empty key.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PartitionKey(pub BTreeMap<String, String>);

impl PartitionKey {
    /// The key of an unpartitioned table.
    pub fn unpartitioned() -> Self {
        Self::default()
    }

    /// Build a key from `(field, value)` pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Value of a partition field, if present.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<unpartitioned>");
        }
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        f.write_str(&parts.join("/"))
    }
}

/// Column-level statistics keyed by column id.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub struct ColumnMetrics {
    /// Number of values (including nulls) per column.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub value_counts: BTreeMap<i32, u64>,
    /// Number of null values per column.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub null_value_counts: BTreeMap<i32, u64>,
    /// Serialized lower bound per column.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lower_bounds: BTreeMap<i32, Vec<u8>>,
    /// Serialized upper bound per column.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub upper_bounds: BTreeMap<i32, Vec<u8>>,
}

/// Immutable descriptor of a single file in the table.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub struct DataFile {
    /// Path relative to the table root (for example `"data/part-0001.parquet"`).
    pub path: String,
    /// Rows or deletes.
    #[serde(default)]
    pub content: FileContent,
    /// File encoding.
    #[serde(default)]
    pub format: FileFormat,
    /// Partition the file belongs to.
    #[serde(default)]
    pub partition: PartitionKey,
    /// Number of records in the file.
    pub record_count: u64,
    /// Size of the file in bytes.
    pub file_size_bytes: u64,
    /// Optional column statistics.
    #[serde(default)]
    pub metrics: ColumnMetrics,
}

impl DataFile {
    /// Descriptor for a regular data file with no column metrics.
    pub fn data(
        path: impl Into<String>,
        partition: PartitionKey,
        record_count: u64,
        file_size_bytes: u64,
    ) -> Self {
        Self {
            path: path.into(),
            content: FileContent::Data,
            format: FileFormat::Parquet,
            partition,
            record_count,
            file_size_bytes,
            metrics: ColumnMetrics::default(),
        }
    }

    /// Same descriptor with a different content kind.
    pub fn with_content(mut self, content: FileContent) -> Self {
        self.content = content;
        self
    }

    /// Same descriptor with column statistics attached.
    pub fn with_metrics(mut self, metrics: ColumnMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Whether this file holds deletes rather than rows.
    pub fn is_delete_file(&self) -> bool {
        self.content != FileContent::Data
    }
}
