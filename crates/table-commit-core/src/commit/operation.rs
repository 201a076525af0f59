//! Metadata transformations accepted by the commit protocol.
use std::collections::BTreeMap;

use crate::model::{DataFile, Operation, PartitionKey};

/// Partition predicate: a file matches when its partition has every listed
/// `field = value` pair. The empty filter matches every file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionFilter(pub BTreeMap<String, String>);

impl PartitionFilter {
    /// Build a filter from `(field, value)` pairs.
    pub fn eq<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
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

    /// Whether `partition` satisfies the filter.
    pub fn matches(&self, partition: &PartitionKey) -> bool {
        self.0
            .iter()
            .all(|(field, value)| partition.get(field) == Some(value.as_str()))
    }
}

/// Replace one set of files with another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteFiles {
    /// Files to retire; each must be live in the base.
    pub removed: Vec<DataFile>,
    /// Files to introduce.
    pub added: Vec<DataFile>,
    /// Data sequence number for `added`. `None` uses the new snapshot's.
    pub sequence_number: Option<i64>,
    /// Snapshot the rewrite was planned against. Changes committed after it
    /// are checked for conflicts.
    pub validate_from: Option<i64>,
}

/// A change to the table's file set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableOperation {
    /// Add files.
    Append {
        /// Files to add.
        files: Vec<DataFile>,
    },
    /// Remove live files by path. Paths that are not live are ignored.
    DeleteByPath {
        /// Paths to remove.
        paths: Vec<String>,
    },
    /// Remove every live file whose partition matches.
    DeleteByFilter {
        /// Partition predicate.
        filter: PartitionFilter,
    },
    /// Replace files (compaction).
    Rewrite(RewriteFiles),
    /// Remove files explicitly and/or by filter, then add files.
    Overwrite {
        /// Optional partition predicate for removal.
        filter: Option<PartitionFilter>,
        /// Files to remove; each must be live in the base.
        removed: Vec<DataFile>,
        /// Files to add.
        added: Vec<DataFile>,
    },
}

impl TableOperation {
    /// Operation recorded in the snapshot summary.
    pub fn snapshot_operation(&self) -> Operation {
        match self {
            TableOperation::Append { .. } => Operation::Append,
            TableOperation::DeleteByPath { .. } | TableOperation::DeleteByFilter { .. } => {
                Operation::Delete
            }
            TableOperation::Rewrite(_) => Operation::Replace,
            TableOperation::Overwrite { .. } => Operation::Overwrite,
        }
    }

    /// Files this operation adds.
    pub fn added_files(&self) -> &[DataFile] {
        match self {
            TableOperation::Append { files } => files,
            TableOperation::Rewrite(rewrite) => &rewrite.added,
            TableOperation::Overwrite { added, .. } => added,
            TableOperation::DeleteByPath { .. } | TableOperation::DeleteByFilter { .. } => &[],
        }
    }

    /// Whether committing requires reading the base snapshot's manifests.
    pub(crate) fn reads_manifests(&self) -> bool {
        !matches!(self, TableOperation::Append { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_requires_every_pair() {
        let key = PartitionKey::from_pairs([("day", "2025-01-01"), ("region", "eu")]);

        assert!(PartitionFilter::default().matches(&key));
        assert!(PartitionFilter::eq([("day", "2025-01-01")]).matches(&key));
        assert!(PartitionFilter::eq([("day", "2025-01-01"), ("region", "eu")]).matches(&key));
        assert!(!PartitionFilter::eq([("region", "us")]).matches(&key));
        assert!(!PartitionFilter::eq([("hour", "1")]).matches(&key));
    }

    #[test]
    fn operation_kinds_map_to_summary_operations() {
        assert_eq!(
            TableOperation::Append { files: vec![] }.snapshot_operation(),
            Operation::Append
        );
        assert_eq!(
            TableOperation::DeleteByPath { paths: vec![] }.snapshot_operation(),
            Operation::Delete
        );
        assert_eq!(
            TableOperation::Rewrite(RewriteFiles::default()).snapshot_operation(),
            Operation::Replace
        );
    }
}
