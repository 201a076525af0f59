//! Building the next snapshot for one commit attempt.
//!
//! The producer is pure with respect to the metadata store: it reads the
//! manifests of the base snapshot, writes the manifests of the new one and
//! returns the derived [`TableMetadata`]. Installing it is the committer's job.
use std::collections::{BTreeSet, HashMap, HashSet};

use snafu::prelude::*;

use crate::commit::manifest_io::{read_manifest, read_manifests, write_manifest};
use crate::commit::validation::{
    snapshots_after, validate_files_live, validate_no_conflicting_deletes,
};
use crate::commit::{
    CommitError, InvalidOperationSnafu, MetadataSnafu, RewriteFiles, TableOperation,
    ValidationSnafu,
};
use crate::io::FileIo;
use crate::model::snapshot::{
    ADDED_DATA_FILES, ADDED_DELETE_FILES, ADDED_FILES_SIZE, ADDED_RECORDS, DELETED_DATA_FILES,
    DELETED_RECORDS, REMOVED_FILES_SIZE, TOTAL_DATA_FILES, TOTAL_RECORDS,
};
use crate::model::{
    DataFile, EntryStatus, Manifest, ManifestEntry, Snapshot, SnapshotSummary, TableMetadata,
};

/// Result of a successful build: new metadata ready to be swapped in.
#[derive(Debug, Clone)]
pub struct PendingSnapshot {
    /// Id of the new snapshot.
    pub snapshot_id: i64,
    /// Sequence number of the new snapshot.
    pub sequence_number: i64,
    /// Manifests listed by the new snapshot.
    pub manifests: Vec<String>,
    /// Base metadata plus the new snapshot.
    pub metadata: TableMetadata,
}

/// Random positive id not used by any snapshot of `base`.
pub(crate) fn new_snapshot_id(base: &TableMetadata) -> i64 {
    loop {
        let (high, _) = uuid::Uuid::new_v4().as_u64_pair();
        let id = (high & i64::MAX as u64) as i64;
        if id != 0 && base.snapshot(id).is_none() {
            return id;
        }
    }
}

/// Build the snapshot that applies `op` on top of `base`.
///
/// Every manifest location written is appended to `written`, including on
/// error, so the caller can clean up after a definite failure.
pub async fn produce(
    io: &dyn FileIo,
    base: &TableMetadata,
    op: &TableOperation,
    written: &mut Vec<String>,
) -> Result<PendingSnapshot, CommitError> {
    let snapshot_id = new_snapshot_id(base);
    let sequence_number = base.last_sequence_number + 1;
    let parent = base.current_snapshot();
    let current_manifests = parent.map(|s| s.manifests.clone()).unwrap_or_default();

    let added_sequence_number = match op {
        TableOperation::Rewrite(RewriteFiles {
            sequence_number: Some(pinned),
            ..
        }) => {
            ensure!(
                *pinned >= 0 && *pinned < sequence_number,
                InvalidOperationSnafu {
                    msg: format!(
                        "rewrite data sequence number {pinned} must be below the new snapshot's {sequence_number}"
                    ),
                }
            );
            *pinned
        }
        _ => sequence_number,
    };

    let mut manifests = Vec::new();
    let mut removed_files: Vec<DataFile> = Vec::new();
    let mut live_totals: Option<(u64, u64)> = None;

    let added = op.added_files();
    if !added.is_empty() {
        let manifest = Manifest {
            added_snapshot_id: snapshot_id,
            entries: added
                .iter()
                .map(|file| ManifestEntry {
                    status: EntryStatus::Added,
                    snapshot_id,
                    sequence_number: added_sequence_number,
                    file: file.clone(),
                })
                .collect(),
        };
        manifests.push(write_manifest(io, &manifest, written).await?);
    }

    if op.reads_manifests() {
        let loaded = read_manifests(io, &current_manifests).await?;
        let to_remove = removal_set(io, base, op, &loaded).await?;

        let mut totals = (0u64, 0u64);
        for (location, manifest) in &loaded {
            for entry in manifest.live_entries() {
                if !entry.file.is_delete_file() && !to_remove.contains(entry.file.path.as_str()) {
                    totals.0 += 1;
                    totals.1 += entry.file.record_count;
                }
            }

            let touched = manifest
                .live_entries()
                .any(|e| to_remove.contains(e.file.path.as_str()));
            if !touched {
                if manifest.has_live_entries() {
                    manifests.push(location.clone());
                }
                continue;
            }

            let entries = manifest
                .live_entries()
                .map(|entry| {
                    if to_remove.contains(entry.file.path.as_str()) {
                        removed_files.push(entry.file.clone());
                        ManifestEntry {
                            status: EntryStatus::Deleted,
                            snapshot_id,
                            ..entry.clone()
                        }
                    } else {
                        ManifestEntry {
                            status: EntryStatus::Existing,
                            ..entry.clone()
                        }
                    }
                })
                .collect();
            let rewritten = Manifest {
                added_snapshot_id: snapshot_id,
                entries,
            };
            manifests.push(write_manifest(io, &rewritten, written).await?);
        }
        live_totals = Some(totals);
    } else {
        manifests.extend(current_manifests);
    }

    let summary = summarize(op, parent, &removed_files, live_totals);
    let snapshot = Snapshot {
        snapshot_id,
        parent_snapshot_id: parent.map(|s| s.snapshot_id),
        sequence_number,
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
        manifests: manifests.clone(),
        summary: Some(summary),
    };
    let metadata = base.with_snapshot(snapshot).context(MetadataSnafu)?;

    Ok(PendingSnapshot {
        snapshot_id,
        sequence_number,
        manifests,
        metadata,
    })
}

/// Paths of live files that `op` removes, after validating the operation.
async fn removal_set<'m>(
    io: &dyn FileIo,
    base: &TableMetadata,
    op: &TableOperation,
    loaded: &'m [(String, Manifest)],
) -> Result<HashSet<&'m str>, CommitError> {
    let live: HashSet<&str> = loaded
        .iter()
        .flat_map(|(_, m)| m.live_entries())
        .map(|e| e.file.path.as_str())
        .collect();

    let matching = |filter: &crate::commit::PartitionFilter| -> HashSet<&'m str> {
        loaded
            .iter()
            .flat_map(|(_, m)| m.live_entries())
            .filter(|e| filter.matches(&e.file.partition))
            .map(|e| e.file.path.as_str())
            .collect()
    };

    let to_remove = match op {
        TableOperation::Append { .. } => HashSet::new(),
        TableOperation::DeleteByPath { paths } => {
            let requested: HashSet<&str> = paths.iter().map(String::as_str).collect();
            live.iter().copied().filter(|p| requested.contains(p)).collect()
        }
        TableOperation::DeleteByFilter { filter } => matching(filter),
        TableOperation::Rewrite(rewrite) => {
            validate_files_live(rewrite.removed.iter().map(|f| f.path.as_str()), &live)
                .context(ValidationSnafu)?;
            if let Some(starting_snapshot_id) = rewrite.validate_from {
                validate_concurrent_deletes(io, base, rewrite, starting_snapshot_id).await?;
            }
            live.iter()
                .copied()
                .filter(|p| rewrite.removed.iter().any(|f| f.path == *p))
                .collect()
        }
        TableOperation::Overwrite {
            filter, removed, ..
        } => {
            validate_files_live(removed.iter().map(|f| f.path.as_str()), &live)
                .context(ValidationSnafu)?;
            let mut set: HashSet<&str> = live
                .iter()
                .copied()
                .filter(|p| removed.iter().any(|f| f.path == *p))
                .collect();
            if let Some(filter) = filter {
                set.extend(matching(filter));
            }
            set
        }
    };
    Ok(to_remove)
}

async fn validate_concurrent_deletes(
    io: &dyn FileIo,
    base: &TableMetadata,
    rewrite: &RewriteFiles,
    starting_snapshot_id: i64,
) -> Result<(), CommitError> {
    let concurrent = snapshots_after(base, starting_snapshot_id).context(ValidationSnafu)?;
    if concurrent.is_empty() {
        return Ok(());
    }

    let partitions: BTreeSet<_> = rewrite
        .removed
        .iter()
        .map(|f| f.partition.clone())
        .collect();

    let mut cache: HashMap<&str, Manifest> = HashMap::new();
    for snapshot in &concurrent {
        for location in &snapshot.manifests {
            if !cache.contains_key(location.as_str()) {
                let manifest = read_manifest(io, location).await?;
                cache.insert(location.as_str(), manifest);
            }
        }
    }

    let pairs = concurrent.iter().flat_map(|snapshot| {
        snapshot
            .manifests
            .iter()
            .filter_map(|location| cache.get(location.as_str()))
            .map(move |manifest| (snapshot.snapshot_id, manifest))
    });
    validate_no_conflicting_deletes(pairs, &partitions, rewrite.sequence_number.is_some())
        .context(ValidationSnafu)
}

fn summarize(
    op: &TableOperation,
    parent: Option<&Snapshot>,
    removed: &[DataFile],
    live_totals_after_removal: Option<(u64, u64)>,
) -> SnapshotSummary {
    let mut summary = SnapshotSummary::new(op.snapshot_operation());
    let added = op.added_files();

    let (added_data, added_deletes): (Vec<&DataFile>, Vec<&DataFile>) =
        added.iter().partition(|f| !f.is_delete_file());
    let removed_data: Vec<&DataFile> = removed.iter().filter(|f| !f.is_delete_file()).collect();

    let added_records: u64 = added_data.iter().map(|f| f.record_count).sum();
    let deleted_records: u64 = removed_data.iter().map(|f| f.record_count).sum();

    summary.set(ADDED_DATA_FILES, added_data.len() as u64);
    summary.set(ADDED_DELETE_FILES, added_deletes.len() as u64);
    summary.set(DELETED_DATA_FILES, removed_data.len() as u64);
    summary.set(ADDED_RECORDS, added_records);
    summary.set(DELETED_RECORDS, deleted_records);
    summary.set(ADDED_FILES_SIZE, added.iter().map(|f| f.file_size_bytes).sum());
    summary.set(REMOVED_FILES_SIZE, removed.iter().map(|f| f.file_size_bytes).sum());

    let totals = match (live_totals_after_removal, parent) {
        (Some(totals), _) => Some(totals),
        (None, None) => Some((0, 0)),
        (None, Some(parent)) => parent.summary.as_ref().and_then(|s| {
            Some((s.get(TOTAL_DATA_FILES)?, s.get(TOTAL_RECORDS)?))
        }),
    };
    if let Some((files, records)) = totals {
        summary.set(TOTAL_DATA_FILES, files + added_data.len() as u64);
        summary.set(TOTAL_RECORDS, records + added_records);
    }
    summary
}
