//! Manifests: immutable batches of file entries.
//!
//! A manifest is written once and never modified. When a commit removes a
//! file that a manifest lists, the commit writes a *new* manifest carrying
//! the survivors as `Existing` and the removed file as `Deleted`; the old
//! manifest simply stops being referenced by the new snapshot.

use serde::{Deserialize, Serialize};

use crate::model::DataFile;

/// Lifecycle status of an entry within a manifest.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Added by the snapshot that wrote the manifest.
    Added,
    /// Carried over from an earlier snapshot.
    Existing,
    /// Removed by the snapshot that wrote the manifest.
    Deleted,
}

/// One file reference inside a manifest.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ManifestEntry {
    /// Added / existing / deleted.
    pub status: EntryStatus,
    /// Snapshot that introduced this status.
    pub snapshot_id: i64,
    /// Data sequence number of the file.
    pub sequence_number: i64,
    /// The referenced file.
    pub file: DataFile,
}

impl ManifestEntry {
    /// Whether the entry is part of the table's live file set.
    pub fn is_live(&self) -> bool {
        self.status != EntryStatus::Deleted
    }
}

/// A list of entries written by one snapshot.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Manifest {
    /// Snapshot that wrote this manifest.
    pub added_snapshot_id: i64,
    /// File entries.
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Iterator over entries still referenced by the table.
    pub fn live_entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter().filter(|e| e.is_live())
    }

    /// Entries added by `snapshot_id` in this manifest.
    pub fn added_by(&self, snapshot_id: i64) -> impl Iterator<Item = &ManifestEntry> {
        self.entries
            .iter()
            .filter(move |e| e.status == EntryStatus::Added && e.snapshot_id == snapshot_id)
    }

    /// Whether any entry is still live.
    pub fn has_live_entries(&self) -> bool {
        self.entries.iter().any(ManifestEntry::is_live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PartitionKey;

    fn entry(status: EntryStatus, snapshot_id: i64, path: &str) -> ManifestEntry {
        ManifestEntry {
            status,
            snapshot_id,
            sequence_number: 1,
            file: DataFile::data(path, PartitionKey::unpartitioned(), 1, 1),
        }
    }

    #[test]
    fn live_and_added_filters() {
        let manifest = Manifest {
            added_snapshot_id: 7,
            entries: vec![
                entry(EntryStatus::Added, 7, "a"),
                entry(EntryStatus::Existing, 3, "b"),
                entry(EntryStatus::Deleted, 7, "c"),
            ],
        };

        let live: Vec<_> = manifest.live_entries().map(|e| e.file.path.as_str()).collect();
        assert_eq!(live, vec!["a", "b"]);

        let added: Vec<_> = manifest.added_by(7).map(|e| e.file.path.as_str()).collect();
        assert_eq!(added, vec!["a"]);
        assert!(manifest.has_live_entries());
    }

    #[test]
    fn manifest_with_only_deletes_has_no_live_entries() {
        let manifest = Manifest {
            added_snapshot_id: 9,
            entries: vec![entry(EntryStatus::Deleted, 9, "a")],
        };
        assert!(!manifest.has_live_entries());
    }
}
