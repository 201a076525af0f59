#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use table_commit_core::commit::TableOperation;
use table_commit_core::config::{CommitConfig, CommitRetryPolicy, CommitServiceConfig};
use table_commit_core::io::LocalFileIo;
use table_commit_core::metadata_store::InMemoryMetadataStore;
use table_commit_core::model::{DataFile, PartitionKey};
use table_commit_core::rewrite::{FileGroupInfo, RewriteFileGroup};
use table_commit_core::storage::TableLocation;
use table_commit_core::table::Table;
use tempfile::TempDir;

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

pub fn file(path: &str) -> DataFile {
    DataFile::data(path, PartitionKey::unpartitioned(), 10, 100)
}

pub fn fast_config() -> CommitConfig {
    CommitConfig {
        retry: CommitRetryPolicy {
            num_retries: 4,
            min_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(10),
            total_timeout: Duration::from_secs(30),
        },
        service: CommitServiceConfig {
            close_timeout: Duration::from_secs(30),
            idle_poll_interval: Duration::from_millis(5),
        },
        ..CommitConfig::default()
    }
}

/// Write placeholder bytes for each path so deletes can be observed.
pub async fn touch(table: &Table, paths: &[&str]) -> TestResult {
    for path in paths {
        table.io().write(path, Bytes::from_static(b"PAR1")).await?;
    }
    Ok(())
}

pub async fn append(table: &Table, paths: &[&str]) -> TestResult {
    touch(table, paths).await?;
    table
        .commit(TableOperation::Append {
            files: paths.iter().map(|p| file(p)).collect(),
        })
        .await?;
    Ok(())
}

/// A local table holding `paths`, with fast retries.
pub async fn local_table(tmp: &TempDir, paths: &[&str]) -> TestResult<Arc<Table>> {
    let table = Table::create_local("events", TableLocation::local(tmp.path()), BTreeMap::new())
        .await?
        .with_config(fast_config());
    append(&table, paths).await?;
    Ok(Arc::new(table))
}

/// A table on an in-memory store holding `paths`. The append uses CAS call 1.
pub async fn memory_table(
    tmp: &TempDir,
    config: CommitConfig,
    paths: &[&str],
) -> TestResult<(InMemoryMetadataStore, Arc<Table>)> {
    let store = InMemoryMetadataStore::new();
    let table = Table::create(
        "events",
        Arc::new(store.clone()),
        Arc::new(LocalFileIo::new(TableLocation::local(tmp.path()))),
        "memory://events",
        BTreeMap::new(),
    )
    .await?
    .with_config(config);
    append(&table, paths).await?;
    Ok((store, Arc::new(table)))
}

pub fn planned_group(index: usize, inputs: &[&str]) -> RewriteFileGroup {
    RewriteFileGroup::new(
        FileGroupInfo {
            global_index: index,
            partition_index: index,
            partition: PartitionKey::unpartitioned(),
        },
        inputs.iter().map(|p| file(p)).collect(),
    )
}

pub fn rewritten_group(index: usize, inputs: &[&str], outputs: &[&str]) -> RewriteFileGroup {
    let mut group = planned_group(index, inputs);
    group.set_output_files(outputs.iter().map(|p| file(p)).collect());
    group
}

pub async fn live_paths(table: &Table) -> TestResult<Vec<String>> {
    let mut paths: Vec<String> = table
        .scan_files()
        .await?
        .files
        .into_iter()
        .map(|f| f.path)
        .collect();
    paths.sort();
    Ok(paths)
}
