//! Partial-progress commit service.
//!
//! Rewrite workers [`offer`](CommitService::offer) completed groups; a single
//! background task takes them off the queue in batches of
//! `rewrites_per_commit` and commits each batch through
//! [`RewriteCommitManager::commit_or_clean`]. Commits never overlap.
//!
//! A batch whose commit fails is logged and dropped. Its groups are not
//! retried and do not appear in [`results`](CommitService::results); other
//! batches carry on.
//!
//! [`close`](CommitService::close) stops intake, lets the committer flush
//! what is queued (possibly as a short final batch) and waits up to the
//! configured timeout. On timeout every still-queued group is aborted and
//! `close` fails with the committed/uncommitted counts. A commit already in
//! flight is never cancelled. Groups still queued after the committer has
//! exited are aborted as well and `close` fails.
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, info, warn};
use snafu::prelude::*;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::CommitServiceConfig;
use crate::rewrite::{
    IllegalStateSnafu, RewriteCommitManager, RewriteError, RewriteFileGroup, ServiceFailedSnafu,
    ServiceTimeoutSnafu,
};

/// Lifecycle of a [`CommitService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Built, not started.
    Created,
    /// Accepting groups.
    Running,
    /// Closed; results are available.
    Closed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Queue and intake flag, guarded together so an offer cannot slip in
/// after intake stopped.
#[derive(Default)]
struct Intake {
    open: bool,
    queue: VecDeque<RewriteFileGroup>,
}

struct Shared {
    manager: RewriteCommitManager,
    rewrites_per_commit: usize,
    idle_poll_interval: Duration,
    intake: Mutex<Intake>,
    in_flight: AtomicUsize,
    committed: Mutex<Vec<RewriteFileGroup>>,
    batches: AtomicUsize,
    wake: Notify,
}

impl Shared {
    /// Take the next batch: a full one, or whatever is left once intake has
    /// stopped.
    fn next_batch(&self) -> Option<Vec<RewriteFileGroup>> {
        let mut intake = lock(&self.intake);
        let ready = intake.queue.len() >= self.rewrites_per_commit
            || (!intake.open && !intake.queue.is_empty());
        if !ready {
            return None;
        }
        let n = self.rewrites_per_commit.min(intake.queue.len());
        let batch: Vec<_> = intake.queue.drain(..n).collect();
        self.in_flight.fetch_add(batch.len(), Ordering::SeqCst);
        Some(batch)
    }

    fn is_drained(&self) -> bool {
        let intake = lock(&self.intake);
        !intake.open && intake.queue.is_empty()
    }

    fn stop_intake(&self) {
        lock(&self.intake).open = false;
        self.wake.notify_one();
    }

    async fn commit_batch(&self, batch: Vec<RewriteFileGroup>) {
        let size = batch.len();
        match self.manager.commit_or_clean(&batch).await {
            Ok(outcome) => {
                info!(
                    "Committed {size} rewritten file groups as snapshot {}",
                    outcome.snapshot_id
                );
                self.batches.fetch_add(1, Ordering::SeqCst);
                lock(&self.committed).extend(batch);
            }
            Err(e) => {
                error!("Failure during rewrite commit process, partial progress enabled. Ignoring: {e}");
            }
        }
        self.in_flight.fetch_sub(size, Ordering::SeqCst);
    }

    async fn run(self: Arc<Self>) {
        loop {
            if let Some(batch) = self.next_batch() {
                self.commit_batch(batch).await;
                continue;
            }
            if self.is_drained() {
                debug!("Commit service queue drained");
                return;
            }
            // Either an offer or close wakes us; the timeout covers a lost wakeup.
            let _ = tokio::time::timeout(self.idle_poll_interval, self.wake.notified()).await;
        }
    }
}

struct Lifecycle {
    state: ServiceState,
    committer: Option<JoinHandle<()>>,
}

/// Background committer for rewritten file groups.
///
/// All methods take `&self`, so producers can share the service through an
/// `Arc`.
pub struct CommitService {
    shared: Arc<Shared>,
    close_timeout: Duration,
    lifecycle: Mutex<Lifecycle>,
}

impl fmt::Debug for CommitService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitService")
            .field("rewrites_per_commit", &self.shared.rewrites_per_commit)
            .field("state", &self.state())
            .field("queued", &lock(&self.shared.intake).queue.len())
            .field("in_flight", &self.shared.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}

impl CommitService {
    /// A service in the `Created` state. A batch size of 0 is treated as 1.
    pub fn new(
        manager: RewriteCommitManager,
        rewrites_per_commit: usize,
        config: CommitServiceConfig,
    ) -> Self {
        info!(
            "Creating commit service for table {} with {rewrites_per_commit} groups per commit",
            manager.table().name()
        );
        Self {
            shared: Arc::new(Shared {
                manager,
                rewrites_per_commit: rewrites_per_commit.max(1),
                idle_poll_interval: config.idle_poll_interval,
                intake: Mutex::new(Intake::default()),
                in_flight: AtomicUsize::new(0),
                committed: Mutex::new(Vec::new()),
                batches: AtomicUsize::new(0),
                wake: Notify::new(),
            }),
            close_timeout: config.close_timeout,
            lifecycle: Mutex::new(Lifecycle {
                state: ServiceState::Created,
                committer: None,
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        lock(&self.lifecycle).state
    }

    /// Groups per commit.
    pub fn rewrites_per_commit(&self) -> usize {
        self.shared.rewrites_per_commit
    }

    /// Batches committed so far.
    pub fn committed_batches(&self) -> usize {
        self.shared.batches.load(Ordering::SeqCst)
    }

    /// Spawn the committer task. Must be called from a tokio runtime.
    pub fn start(&self) -> Result<(), RewriteError> {
        let mut lifecycle = lock(&self.lifecycle);
        ensure!(
            lifecycle.state == ServiceState::Created,
            IllegalStateSnafu {
                msg: "Rewrite commit service already started",
            }
        );
        info!(
            "Starting commit service for {}",
            self.shared.manager.table().name()
        );
        lock(&self.shared.intake).open = true;
        lifecycle.committer = Some(tokio::spawn(Arc::clone(&self.shared).run()));
        lifecycle.state = ServiceState::Running;
        Ok(())
    }

    /// Queue a rewritten group for commit.
    pub fn offer(&self, group: RewriteFileGroup) -> Result<(), RewriteError> {
        {
            let mut intake = lock(&self.shared.intake);
            ensure!(
                intake.open,
                IllegalStateSnafu {
                    msg: "Cannot add rewrites to a service which is not running",
                }
            );
            debug!("Offered to commit service: {group}");
            intake.queue.push_back(group);
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Stop intake and wait for queued groups to be committed.
    pub async fn close(&self) -> Result<(), RewriteError> {
        let committer = {
            let mut lifecycle = lock(&self.lifecycle);
            ensure!(
                lifecycle.state == ServiceState::Running,
                IllegalStateSnafu {
                    msg: "Cannot close a commit service that is not running",
                }
            );
            lifecycle.state = ServiceState::Closed;
            lifecycle.committer.take()
        };

        info!(
            "Closing commit service for {} waiting for all commits to finish",
            self.shared.manager.table().name()
        );
        self.shared.stop_intake();

        let Some(committer) = committer else {
            return Ok(());
        };

        match tokio::time::timeout(self.close_timeout, committer).await {
            Ok(Ok(())) => {
                let leftover = self.abort_queued().await;
                ensure!(
                    leftover == 0,
                    IllegalStateSnafu {
                        msg: format!(
                            "{leftover} file groups offered after service was closed, \
                             they were not successfully committed"
                        ),
                    }
                );
                Ok(())
            }
            Ok(Err(join_err)) => {
                let aborted = self.abort_queued().await;
                ServiceFailedSnafu {
                    msg: format!("committer task failed ({join_err}); {aborted} queued groups aborted"),
                }
                .fail()
            }
            Err(_) => {
                warn!(
                    "Commit operation did not complete within {:?} of all files being rewritten. \
                     This may mean that some changes were not successfully committed to the table.",
                    self.close_timeout
                );
                let queued = self.abort_queued().await;
                let in_flight = self.shared.in_flight.load(Ordering::SeqCst);
                let committed = lock(&self.shared.committed).len();
                ServiceTimeoutSnafu {
                    committed,
                    uncommitted: queued + in_flight,
                }
                .fail()
            }
        }
    }

    /// Abort every queued group; returns how many there were.
    async fn abort_queued(&self) -> usize {
        let queued: Vec<_> = lock(&self.shared.intake).queue.drain(..).collect();
        if !queued.is_empty() {
            error!("Attempting to cleanup {} uncommitted file groups", queued.len());
        }
        for group in &queued {
            if let Err(e) = self.shared.manager.abort_file_group(group).await {
                warn!("Failed to abort file group {group}: {e}");
            }
        }
        queued.len()
    }

    /// Groups committed, in commit order. Only available once closed.
    pub fn results(&self) -> Result<Vec<RewriteFileGroup>, RewriteError> {
        ensure!(
            self.state() == ServiceState::Closed,
            IllegalStateSnafu {
                msg: "Cannot get results from a service which has not been closed",
            }
        );
        Ok(lock(&self.shared.committed).clone())
    }
}

impl Drop for CommitService {
    fn drop(&mut self) {
        // Let a still-running committer flush and exit.
        self.shared.stop_intake();
    }
}
