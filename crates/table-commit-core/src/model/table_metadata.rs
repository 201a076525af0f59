//! Table-level metadata: the value a metadata pointer points at.
//!
//! `TableMetadata` is immutable from the engine's point of view. A commit
//! derives a new value with [`TableMetadata::with_snapshot`] and installs it
//! through a compare-and-swap on the metadata store.
use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::model::Snapshot;

/// Current metadata format version.
///
/// Bumped only on a breaking change to the JSON layout.
pub const TABLE_FORMAT_VERSION: u32 = 2;

/// Entry of the snapshot log: which snapshot became current and when.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotLogEntry {
    /// When the snapshot became current.
    pub timestamp_ms: i64,
    /// The snapshot that became current.
    pub snapshot_id: i64,
}

/// Errors raised when a new snapshot would break metadata invariants.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum TableMetadataError {
    /// A snapshot with this id already exists.
    #[snafu(display("Snapshot id {snapshot_id} already exists in table metadata"))]
    DuplicateSnapshotId {
        /// The clashing id.
        snapshot_id: i64,
    },

    /// Sequence numbers must strictly increase.
    #[snafu(display(
        "Snapshot sequence number {sequence_number} must be greater than last sequence number {last_sequence_number}"
    ))]
    NonIncreasingSequenceNumber {
        /// Sequence number of the rejected snapshot.
        sequence_number: i64,
        /// Highest sequence number already assigned.
        last_sequence_number: i64,
    },
}

/// Full table metadata.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TableMetadata {
    /// Layout version of this document.
    pub format_version: u32,
    /// Stable identity of the table.
    pub table_uuid: String,
    /// Table root, for display.
    pub location: String,
    /// Highest sequence number assigned to any snapshot.
    pub last_sequence_number: i64,
    /// Time of the last metadata change.
    pub last_updated_ms: i64,
    /// Snapshot readers should see, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_snapshot_id: Option<i64>,
    /// Every snapshot still tracked by the table.
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
    /// History of current-snapshot changes.
    #[serde(default)]
    pub snapshot_log: Vec<SnapshotLogEntry>,
    /// Table properties (see [`crate::config`] for recognized keys).
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl TableMetadata {
    /// Metadata of a freshly created, empty table.
    pub fn new(location: impl Into<String>, properties: BTreeMap<String, String>) -> Self {
        Self {
            format_version: TABLE_FORMAT_VERSION,
            table_uuid: uuid::Uuid::new_v4().to_string(),
            location: location.into(),
            last_sequence_number: 0,
            last_updated_ms: chrono::Utc::now().timestamp_millis(),
            current_snapshot_id: None,
            snapshots: Vec::new(),
            snapshot_log: Vec::new(),
            properties,
        }
    }

    /// The current snapshot, if the table has one.
    pub fn current_snapshot(&self) -> Option<&Snapshot> {
        self.current_snapshot_id.and_then(|id| self.snapshot(id))
    }

    /// Look up a snapshot by id.
    pub fn snapshot(&self, snapshot_id: i64) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.snapshot_id == snapshot_id)
    }

    /// Walk the lineage starting at `snapshot_id` (inclusive) towards the root.
    pub fn ancestors_of(&self, snapshot_id: i64) -> impl Iterator<Item = &Snapshot> {
        let mut next = self.snapshot(snapshot_id);
        let mut seen = HashSet::new();
        std::iter::from_fn(move || {
            let current = next?;
            if !seen.insert(current.snapshot_id) {
                return None;
            }
            next = current.parent_snapshot_id.and_then(|p| self.snapshot(p));
            Some(current)
        })
    }

    /// Snapshots committed on the current lineage after `starting_snapshot_id`,
    /// oldest first.
    ///
    /// Returns `None` when `starting_snapshot_id` is not an ancestor of the
    /// current snapshot. A `None` start means "since table creation".
    pub fn snapshots_since(&self, starting_snapshot_id: Option<i64>) -> Option<Vec<&Snapshot>> {
        let Some(current) = self.current_snapshot_id else {
            return starting_snapshot_id.is_none().then(Vec::new);
        };

        let mut newer = Vec::new();
        for snapshot in self.ancestors_of(current) {
            if Some(snapshot.snapshot_id) == starting_snapshot_id {
                newer.reverse();
                return Some(newer);
            }
            newer.push(snapshot);
        }

        starting_snapshot_id.is_none().then(|| {
            newer.reverse();
            newer
        })
    }

    /// Derive new metadata with `snapshot` appended and made current.
    pub fn with_snapshot(&self, snapshot: Snapshot) -> Result<Self, TableMetadataError> {
        ensure!(
            self.snapshot(snapshot.snapshot_id).is_none(),
            DuplicateSnapshotIdSnafu {
                snapshot_id: snapshot.snapshot_id
            }
        );
        ensure!(
            snapshot.sequence_number > self.last_sequence_number,
            NonIncreasingSequenceNumberSnafu {
                sequence_number: snapshot.sequence_number,
                last_sequence_number: self.last_sequence_number,
            }
        );

        let mut next = self.clone();
        next.last_sequence_number = snapshot.sequence_number;
        next.last_updated_ms = snapshot.timestamp_ms.max(self.last_updated_ms);
        next.current_snapshot_id = Some(snapshot.snapshot_id);
        next.snapshot_log.push(SnapshotLogEntry {
            timestamp_ms: snapshot.timestamp_ms,
            snapshot_id: snapshot.snapshot_id,
        });
        next.snapshots.push(snapshot);
        Ok(next)
    }
}
