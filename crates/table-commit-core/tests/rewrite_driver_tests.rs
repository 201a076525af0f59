//! Integration tests for running a rewrite end to end through the driver.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use common::*;
use table_commit_core::config::PartialProgressConfig;
use table_commit_core::model::{DataFile, PartitionKey};
use table_commit_core::rewrite::{
    BoxError, GroupRewriter, RewriteCommitManager, RewriteDriver, RewriteError, RewriteFileGroup,
};
use table_commit_core::table::Table;
use tempfile::TempDir;

/// Writes one `<first input>.compacted` file per group, or fails for the
/// configured groups.
#[derive(Debug)]
struct CompactingRewriter {
    table: Arc<Table>,
    failing: HashSet<usize>,
}

#[async_trait]
impl GroupRewriter for CompactingRewriter {
    async fn rewrite(&self, group: &RewriteFileGroup) -> Result<Vec<DataFile>, BoxError> {
        if self.failing.contains(&group.info().global_index) {
            return Err(format!("writer crashed on group {}", group.info().global_index).into());
        }
        let path = format!("{}.compacted", group.rewritten_files()[0].path);
        self.table
            .io()
            .write(&path, Bytes::from_static(b"PAR1"))
            .await?;
        let records = group.rewritten_files().iter().map(|f| f.record_count).sum();
        Ok(vec![DataFile::data(
            path,
            PartitionKey::unpartitioned(),
            records,
            group.rewritten_bytes() / 2,
        )])
    }
}

fn plan() -> Vec<RewriteFileGroup> {
    vec![
        planned_group(0, &["data/a", "data/b"]),
        planned_group(1, &["data/c"]),
        planned_group(2, &["data/d", "data/e"]),
        planned_group(3, &["data/f"]),
    ]
}

fn driver(table: &Arc<Table>, failing: &[usize]) -> RewriteDriver<CompactingRewriter> {
    let rewriter = CompactingRewriter {
        table: table.clone(),
        failing: failing.iter().copied().collect(),
    };
    RewriteDriver::new(RewriteCommitManager::new(table.clone()), Arc::new(rewriter))
        .with_max_concurrent_rewrites(2)
}

const INPUTS: [&str; 6] = ["data/a", "data/b", "data/c", "data/d", "data/e", "data/f"];

#[tokio::test]
async fn rewrite_without_partial_progress_commits_once() -> TestResult {
    let tmp = TempDir::new()?;
    let table = local_table(&tmp, &INPUTS).await?;

    let result = driver(&table, &[]).execute(plan()).await?;

    assert_eq!(result.committed_groups.len(), 4);
    assert!(result.failed_groups.is_empty());
    assert_eq!(result.rewritten_files_count, 6);
    assert_eq!(result.added_files_count, 4);
    assert_eq!(table.current().metadata.snapshots.len(), 2);
    assert_eq!(
        live_paths(&table).await?,
        vec![
            "data/a.compacted",
            "data/c.compacted",
            "data/d.compacted",
            "data/f.compacted"
        ]
    );
    Ok(())
}

#[tokio::test]
async fn failed_rewrite_aborts_everything_without_partial_progress() -> TestResult {
    let tmp = TempDir::new()?;
    let table = local_table(&tmp, &INPUTS).await?;

    let err = driver(&table, &[2])
        .execute(plan())
        .await
        .expect_err("group 2 fails");

    assert!(matches!(err, RewriteError::Rewrite { group: 2, .. }));
    assert_eq!(live_paths(&table).await?, INPUTS.to_vec());
    for output in ["data/a.compacted", "data/c.compacted", "data/f.compacted"] {
        assert!(!table.io().exists(output).await?, "{output} should be deleted");
    }
    Ok(())
}

#[tokio::test]
async fn partial_progress_commits_survivors_in_bounded_commits() -> TestResult {
    let tmp = TempDir::new()?;
    let table = local_table(&tmp, &INPUTS).await?;

    let result = driver(&table, &[1])
        .with_partial_progress(PartialProgressConfig {
            enabled: true,
            max_commits: 2,
        })
        .execute(plan())
        .await?;

    assert_eq!(result.committed_groups.len(), 3);
    let failed: Vec<usize> = result.failed_groups.iter().map(|g| g.global_index).collect();
    assert_eq!(failed, vec![1]);
    assert_eq!(result.rewritten_files_count, 5);
    // One append plus at most two rewrite commits.
    assert!(table.current().metadata.snapshots.len() <= 3);
    assert_eq!(
        live_paths(&table).await?,
        vec![
            "data/a.compacted",
            "data/c",
            "data/d.compacted",
            "data/f.compacted"
        ]
    );
    Ok(())
}

#[tokio::test]
async fn empty_plan_is_a_no_op() -> TestResult {
    let tmp = TempDir::new()?;
    let table = local_table(&tmp, &["data/a"]).await?;

    let result = driver(&table, &[]).execute(Vec::new()).await?;

    assert!(result.committed_groups.is_empty());
    assert_eq!(table.current().metadata.snapshots.len(), 1);
    Ok(())
}
