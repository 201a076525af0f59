//! Files produced by one task.
use crate::model::DataFile;

/// Accumulates the data files a single task wrote.
///
/// A collector belongs to exactly one task and is never shared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFileCollector {
    files: Vec<DataFile>,
}

impl TaskFileCollector {
    /// An empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a file the task finished writing.
    pub fn add(&mut self, file: DataFile) {
        self.files.push(file);
    }

    /// Files recorded so far, in write order.
    pub fn files(&self) -> &[DataFile] {
        &self.files
    }

    /// Number of files recorded.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the task wrote nothing.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Take the recorded files.
    pub fn into_files(self) -> Vec<DataFile> {
        self.files
    }
}

impl Extend<DataFile> for TaskFileCollector {
    fn extend<T: IntoIterator<Item = DataFile>>(&mut self, iter: T) {
        self.files.extend(iter);
    }
}
