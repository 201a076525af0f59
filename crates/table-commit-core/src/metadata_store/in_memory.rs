//! In-process metadata store.
//!
//! Holds the pointer in memory behind a mutex. Besides embedding, it is the
//! store used to exercise the commit protocol: faults can be injected for a
//! given CAS call and every CAS can be slowed down by a fixed delay.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::metadata_store::{CasOutcome, MetadataHandle, MetadataStore, StoreError};
use crate::model::TableMetadata;

/// A failure to force on a specific compare-and-swap call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasFault {
    /// Report a conflict without looking at the pointer.
    Conflict,
    /// Report an unknown outcome; the swap is not applied.
    Unknown,
    /// Apply the swap, then report an unknown outcome.
    UnknownAfterCommit,
    /// Fail with [`StoreError::Unavailable`]; the swap is not applied.
    Unavailable,
}

#[derive(Debug, Default)]
struct State {
    current: Option<MetadataHandle>,
    cas_calls: usize,
    faults: HashMap<usize, CasFault>,
    cas_delay: Option<Duration>,
}

/// [`MetadataStore`] kept in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetadataStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryMetadataStore {
    /// Empty store with no table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // State is only replaced wholesale, so a poisoned lock holds no torn data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Force `fault` on the `call_number`-th CAS (1-based, counted over the
    /// lifetime of the store).
    pub fn inject_fault_at(&self, call_number: usize, fault: CasFault) {
        self.lock().faults.insert(call_number, fault);
    }

    /// Force `fault` on the next CAS call.
    pub fn inject_next_fault(&self, fault: CasFault) {
        let mut state = self.lock();
        let next = state.cas_calls + 1;
        state.faults.insert(next, fault);
    }

    /// Sleep this long inside every CAS before touching the pointer.
    pub fn set_cas_delay(&self, delay: Duration) {
        self.lock().cas_delay = Some(delay);
    }

    /// Number of CAS calls received so far.
    pub fn cas_calls(&self) -> usize {
        self.lock().cas_calls
    }

    fn handle(version: u64, metadata: TableMetadata) -> MetadataHandle {
        MetadataHandle {
            version,
            metadata_location: format!("memory://v{version}"),
            metadata: Arc::new(metadata),
        }
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn create(&self, metadata: TableMetadata) -> Result<MetadataHandle, StoreError> {
        let mut state = self.lock();
        if let Some(current) = &state.current {
            return Err(StoreError::TableExists {
                version: current.version,
            });
        }
        let handle = Self::handle(1, metadata);
        state.current = Some(handle.clone());
        Ok(handle)
    }

    async fn read(&self) -> Result<MetadataHandle, StoreError> {
        self.lock().current.clone().ok_or(StoreError::NoTable)
    }

    async fn compare_and_swap(
        &self,
        expected: &MetadataHandle,
        next: TableMetadata,
    ) -> Result<CasOutcome, StoreError> {
        let (call, delay) = {
            let mut state = self.lock();
            state.cas_calls += 1;
            (state.cas_calls, state.cas_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        let fault = state.faults.remove(&call);
        let found = state.current.as_ref().map_or(0, |h| h.version);

        match fault {
            Some(CasFault::Conflict) => {
                return Ok(CasOutcome::Conflict {
                    expected: expected.version,
                    found,
                });
            }
            Some(CasFault::Unknown) => {
                return Ok(CasOutcome::Unknown {
                    reason: format!("injected unknown outcome on CAS call {call}"),
                });
            }
            Some(CasFault::Unavailable) => {
                return Err(StoreError::Unavailable {
                    msg: format!("injected failure on CAS call {call}"),
                });
            }
            Some(CasFault::UnknownAfterCommit) | None => {}
        }

        if found != expected.version {
            return Ok(CasOutcome::Conflict {
                expected: expected.version,
                found,
            });
        }

        let handle = Self::handle(found + 1, next);
        state.current = Some(handle.clone());

        if fault == Some(CasFault::UnknownAfterCommit) {
            return Ok(CasOutcome::Unknown {
                reason: format!("injected unknown outcome after commit on CAS call {call}"),
            });
        }
        Ok(CasOutcome::Committed(handle))
    }
}
