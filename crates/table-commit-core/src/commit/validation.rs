//! Conflict detection for rewrites.
//!
//! A rewrite was planned against a starting snapshot. Before it may commit
//! on top of a newer base, every snapshot committed in between is checked:
//! a position delete added to a partition being rewritten could target rows
//! of a file that no longer exists after the rewrite, so it always conflicts.
//! Equality deletes only conflict when the rewritten files get a new data
//! sequence number, because they would then stop applying to the rewritten
//! rows.
use std::collections::{BTreeSet, HashSet};

use snafu::{Backtrace, prelude::*};

use crate::model::{FileContent, Manifest, PartitionKey, Snapshot, TableMetadata};

/// A concurrent change that conflicts with a commit.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ValidationError {
    /// A file to be removed is not live in the base snapshot.
    #[snafu(display("File {path} is not live in the current snapshot"))]
    MissingFile {
        /// Path of the file.
        path: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The starting snapshot is not on the lineage of the current snapshot.
    #[snafu(display("Starting snapshot {snapshot_id} is not an ancestor of the current snapshot"))]
    StartingSnapshotNotAncestor {
        /// The starting snapshot.
        snapshot_id: i64,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A snapshot committed after the starting snapshot added delete files
    /// to a partition being rewritten.
    #[snafu(display(
        "Snapshot {snapshot_id} added {content:?} file {path} to rewritten partition {partition}"
    ))]
    ConflictingDeleteFile {
        /// The conflicting snapshot.
        snapshot_id: i64,
        /// Path of the delete file.
        path: String,
        /// Kind of delete file.
        content: FileContent,
        /// Partition of the delete file.
        partition: PartitionKey,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

/// Snapshots committed after `starting_snapshot_id`, oldest first.
pub(crate) fn snapshots_after(
    base: &TableMetadata,
    starting_snapshot_id: i64,
) -> Result<Vec<&Snapshot>, ValidationError> {
    base.snapshots_since(Some(starting_snapshot_id))
        .context(StartingSnapshotNotAncestorSnafu {
            snapshot_id: starting_snapshot_id,
        })
}

/// Check the manifests written by concurrent snapshots for delete files that
/// conflict with rewriting `partitions`.
///
/// `concurrent` pairs each concurrent snapshot id with one of its manifests.
pub(crate) fn validate_no_conflicting_deletes<'a>(
    concurrent: impl IntoIterator<Item = (i64, &'a Manifest)>,
    partitions: &BTreeSet<PartitionKey>,
    pins_sequence_number: bool,
) -> Result<(), ValidationError> {
    for (snapshot_id, manifest) in concurrent {
        for entry in manifest.added_by(snapshot_id) {
            let file = &entry.file;
            let conflicts = match file.content {
                FileContent::Data => false,
                FileContent::PositionDeletes => true,
                FileContent::EqualityDeletes => !pins_sequence_number,
            };
            if conflicts && partitions.contains(&file.partition) {
                return ConflictingDeleteFileSnafu {
                    snapshot_id,
                    path: file.path.clone(),
                    content: file.content,
                    partition: file.partition.clone(),
                }
                .fail();
            }
        }
    }
    Ok(())
}

/// Every path in `removed` must be in `live`.
pub(crate) fn validate_files_live<'a>(
    removed: impl IntoIterator<Item = &'a str>,
    live: &HashSet<&str>,
) -> Result<(), ValidationError> {
    for path in removed {
        ensure!(live.contains(path), MissingFileSnafu { path });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataFile, EntryStatus, ManifestEntry};

    fn manifest(snapshot_id: i64, files: Vec<DataFile>) -> Manifest {
        Manifest {
            added_snapshot_id: snapshot_id,
            entries: files
                .into_iter()
                .map(|file| ManifestEntry {
                    status: EntryStatus::Added,
                    snapshot_id,
                    sequence_number: 5,
                    file,
                })
                .collect(),
        }
    }

    fn day(d: &str) -> PartitionKey {
        PartitionKey::from_pairs([("day", d)])
    }

    #[test]
    fn position_deletes_in_rewritten_partition_conflict() {
        let deletes = manifest(
            7,
            vec![
                DataFile::data("data/pos.parquet", day("1"), 1, 1)
                    .with_content(FileContent::PositionDeletes),
            ],
        );
        let partitions = BTreeSet::from([day("1")]);

        let err = validate_no_conflicting_deletes([(7, &deletes)], &partitions, true)
            .expect_err("position deletes always conflict");
        assert!(matches!(
            err,
            ValidationError::ConflictingDeleteFile { snapshot_id: 7, .. }
        ));
    }

    #[test]
    fn equality_deletes_conflict_only_without_pinned_sequence() {
        let deletes = manifest(
            7,
            vec![
                DataFile::data("data/eq.parquet", day("1"), 1, 1)
                    .with_content(FileContent::EqualityDeletes),
            ],
        );
        let partitions = BTreeSet::from([day("1")]);

        assert!(validate_no_conflicting_deletes([(7, &deletes)], &partitions, true).is_ok());
        assert!(validate_no_conflicting_deletes([(7, &deletes)], &partitions, false).is_err());
    }

    #[test]
    fn deletes_in_other_partitions_and_data_files_are_fine() {
        let concurrent = manifest(
            7,
            vec![
                DataFile::data("data/pos.parquet", day("2"), 1, 1)
                    .with_content(FileContent::PositionDeletes),
                DataFile::data("data/new.parquet", day("1"), 1, 1),
            ],
        );
        let partitions = BTreeSet::from([day("1")]);

        assert!(validate_no_conflicting_deletes([(7, &concurrent)], &partitions, false).is_ok());
    }

    #[test]
    fn removed_files_must_be_live() {
        let live = HashSet::from(["data/a.parquet"]);

        assert!(validate_files_live(["data/a.parquet"], &live).is_ok());
        let err = validate_files_live(["data/a.parquet", "data/gone.parquet"], &live)
            .expect_err("gone is not live");
        assert!(matches!(err, ValidationError::MissingFile { ref path, .. } if path == "data/gone.parquet"));
    }
}
