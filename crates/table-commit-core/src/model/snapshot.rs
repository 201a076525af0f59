//! Snapshots: immutable, versioned views of the table's file set.
//!
//! JSON layout (keys in kebab-case, optional keys omitted when absent):
//!
//! ```json
//! {
//!   "snapshot-id": 3051729675574597004,
//!   "parent-snapshot-id": 1011,
//!   "sequence-number": 4,
//!   "timestamp-ms": 1735689600000,
//!   "manifests": ["metadata/manifest-0b6f.json"],
//!   "summary": { "operation": "replace", "added-data-files": "2" }
//! }
//! ```
//!
//! The minimal form `{snapshot-id, timestamp-ms, manifests}` is accepted on
//! read; the sequence number then defaults to `0` and the summary to none.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

/// The kind of change a snapshot made.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Only files were added.
    Append,
    /// Files were replaced without changing table data (rewrite/compaction).
    Replace,
    /// Files were removed and added.
    Overwrite,
    /// Only files were removed.
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Append => "append",
            Operation::Replace => "replace",
            Operation::Overwrite => "overwrite",
            Operation::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Summary key: number of data files added.
pub const ADDED_DATA_FILES: &str = "added-data-files";
/// Summary key: number of data files removed.
pub const DELETED_DATA_FILES: &str = "deleted-data-files";
/// Summary key: number of delete files added.
pub const ADDED_DELETE_FILES: &str = "added-delete-files";
/// Summary key: records in added files.
pub const ADDED_RECORDS: &str = "added-records";
/// Summary key: records in removed files.
pub const DELETED_RECORDS: &str = "deleted-records";
/// Summary key: bytes added.
pub const ADDED_FILES_SIZE: &str = "added-files-size";
/// Summary key: bytes removed.
pub const REMOVED_FILES_SIZE: &str = "removed-files-size";
/// Summary key: live data files after the commit.
pub const TOTAL_DATA_FILES: &str = "total-data-files";
/// Summary key: live records after the commit.
pub const TOTAL_RECORDS: &str = "total-records";

/// Operation plus free-form counters describing a snapshot.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotSummary {
    /// What the commit did.
    pub operation: Operation,
    /// Counters and other properties (see the `*_FILES`/`*_RECORDS` keys).
    #[serde(flatten)]
    pub properties: BTreeMap<String, String>,
}

impl SnapshotSummary {
    /// A summary with no counters.
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            properties: BTreeMap::new(),
        }
    }

    /// Record a numeric counter.
    pub fn set(&mut self, key: &str, value: u64) {
        self.properties.insert(key.to_string(), value.to_string());
    }

    /// Read a numeric counter, if present and well-formed.
    pub fn get(&self, key: &str) -> Option<u64> {
        self.properties.get(key).and_then(|v| v.parse().ok())
    }
}

/// An immutable snapshot of the table.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Snapshot {
    /// Unique id of the snapshot.
    pub snapshot_id: i64,
    /// Snapshot this one was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_snapshot_id: Option<i64>,
    /// Logical commit order.
    #[serde(default)]
    pub sequence_number: i64,
    /// Commit wall-clock time in milliseconds since the epoch.
    pub timestamp_ms: i64,
    /// Manifest locations making up the snapshot.
    pub manifests: Vec<String>,
    /// What the commit did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SnapshotSummary>,
}

impl Snapshot {
    /// The operation recorded in the summary, if any.
    pub fn operation(&self) -> Option<Operation> {
        self.summary.as_ref().map(|s| s.operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_json_roundtrip_with_summary() {
        let mut summary = SnapshotSummary::new(Operation::Replace);
        summary.set(ADDED_DATA_FILES, 2);
        summary.set(DELETED_DATA_FILES, 3);

        let snapshot = Snapshot {
            snapshot_id: 42,
            parent_snapshot_id: Some(41),
            sequence_number: 5,
            timestamp_ms: 1_735_689_600_000,
            manifests: vec!["metadata/manifest-a.json".to_string()],
            summary: Some(summary),
        };

        let json = serde_json::to_string(&snapshot).expect("serialize");
        assert!(json.contains(r#""snapshot-id":42"#));
        assert!(json.contains(r#""timestamp-ms":1735689600000"#));
        assert!(json.contains(r#""operation":"replace""#));
        assert!(json.contains(r#""added-data-files":"2""#));

        let decoded: Snapshot = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(decoded, snapshot);
        assert_eq!(decoded.summary.as_ref().and_then(|s| s.get(DELETED_DATA_FILES)), Some(3));
    }

    #[test]
    fn minimal_snapshot_json_parses_with_defaults() {
        let json = r#"{
            "snapshot-id": 7,
            "timestamp-ms": 1000,
            "manifests": ["m1.json", "m2.json"]
        }"#;

        let snapshot: Snapshot = serde_json::from_str(json).expect("deserialize");

        assert_eq!(snapshot.snapshot_id, 7);
        assert_eq!(snapshot.parent_snapshot_id, None);
        assert_eq!(snapshot.sequence_number, 0);
        assert_eq!(snapshot.manifests.len(), 2);
        assert_eq!(snapshot.operation(), None);
    }

    #[test]
    fn root_snapshot_omits_parent_key() {
        let snapshot = Snapshot {
            snapshot_id: 1,
            parent_snapshot_id: None,
            sequence_number: 1,
            timestamp_ms: 1,
            manifests: vec![],
            summary: None,
        };
        let json = serde_json::to_string(&snapshot).expect("serialize");
        assert!(!json.contains("parent-snapshot-id"));
        assert!(!json.contains("summary"));
    }
}
