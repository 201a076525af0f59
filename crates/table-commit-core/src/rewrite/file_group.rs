//! A unit of rewrite work.
use std::fmt;

use snafu::prelude::*;

use crate::model::{DataFile, PartitionKey};
use crate::rewrite::{IllegalStateSnafu, RewriteError};

/// Where a group sits in the rewrite plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileGroupInfo {
    /// Index among all groups of the rewrite.
    pub global_index: usize,
    /// Index among the groups of the same partition.
    pub partition_index: usize,
    /// Partition the group's files belong to.
    pub partition: PartitionKey,
}

/// Input files to retire plus, once the rewrite ran, the files replacing them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteFileGroup {
    info: FileGroupInfo,
    rewritten_files: Vec<DataFile>,
    added_files: Option<Vec<DataFile>>,
}

impl RewriteFileGroup {
    /// A planned group that has not been rewritten yet.
    pub fn new(info: FileGroupInfo, rewritten_files: Vec<DataFile>) -> Self {
        Self {
            info,
            rewritten_files,
            added_files: None,
        }
    }

    /// Plan position of the group.
    pub fn info(&self) -> &FileGroupInfo {
        &self.info
    }

    /// Files the group replaces.
    pub fn rewritten_files(&self) -> &[DataFile] {
        &self.rewritten_files
    }

    /// Files the rewrite produced, or `None` before it ran.
    pub fn added_files(&self) -> Option<&[DataFile]> {
        self.added_files.as_deref()
    }

    /// Files the rewrite produced. Fails if the rewrite has not run.
    pub fn require_added_files(&self) -> Result<&[DataFile], RewriteError> {
        self.added_files().context(IllegalStateSnafu {
            msg: format!("file group {self} was not rewritten"),
        })
    }

    /// Attach the rewrite output.
    pub fn set_output_files(&mut self, files: Vec<DataFile>) {
        self.added_files = Some(files);
    }

    /// Total bytes of the input files.
    pub fn rewritten_bytes(&self) -> u64 {
        self.rewritten_files.iter().map(|f| f.file_size_bytes).sum()
    }

    /// Number of input files.
    pub fn num_files(&self) -> usize {
        self.rewritten_files.len()
    }
}

impl fmt::Display for RewriteFileGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} ({}, partition index {}, {} files)",
            self.info.global_index,
            self.info.partition,
            self.info.partition_index,
            self.rewritten_files.len()
        )
    }
}
