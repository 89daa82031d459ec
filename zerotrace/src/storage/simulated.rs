//! Deterministic in-memory snapshot backend for tests and `test_mode`.
//!
//! Latency is simulated with `tokio::time::sleep`, failures are injected
//! explicitly, and every effective deletion is counted per handle so tests
//! can prove a snapshot was never deleted twice.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{SnapshotHandle, SnapshotProvider};
use crate::error::SpaceError;
use crate::space::SpaceId;

/// Injected failures for the next `n` calls of one operation.
#[derive(Debug, Default, Clone)]
pub struct FaultPlan {
    remaining: usize,
    reason: String,
}

impl FaultPlan {
    pub fn arm(&mut self, count: usize, reason: impl Into<String>) {
        self.remaining = count;
        self.reason = reason.into();
    }

    /// Consume one injected failure, if any are left.
    pub fn take(&mut self) -> Option<String> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.reason.clone())
    }
}

#[derive(Debug, Default)]
struct SimState {
    live: BTreeSet<SnapshotHandle>,
    create_faults: FaultPlan,
    delete_faults: FaultPlan,
    created: u64,
    deletions: HashMap<SnapshotHandle, u32>,
}

#[derive(Debug)]
pub struct SimulatedSnapshotProvider {
    create_latency: Duration,
    delete_latency: Duration,
    /// Maximum snapshots the simulated pool can hold.
    capacity: Option<usize>,
    state: Mutex<SimState>,
}

impl SimulatedSnapshotProvider {
    pub fn new(create_latency: Duration, delete_latency: Duration) -> Self {
        Self {
            create_latency,
            delete_latency,
            capacity: None,
            state: Mutex::new(SimState::default()),
        }
    }

    /// A provider with no simulated latency.
    pub fn instant() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Limit how many snapshots may exist at once; creation beyond it fails
    /// as if the pool ran out of space.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_next_creates(&self, count: usize) {
        self.state().create_faults.arm(count, "injected snapshot failure");
    }

    pub fn fail_next_deletes(&self, count: usize) {
        self.state().delete_faults.arm(count, "injected delete failure");
    }

    /// Plant a snapshot nobody tracks, as a crashed session would leave behind.
    pub fn insert_orphan(&self, handle: SnapshotHandle) {
        self.state().live.insert(handle);
    }

    pub fn contains(&self, handle: &SnapshotHandle) -> bool {
        self.state().live.contains(handle)
    }

    pub fn live_count(&self) -> usize {
        self.state().live.len()
    }

    pub fn created_count(&self) -> u64 {
        self.state().created
    }

    /// How many times `handle` was actually removed (no-op deletes excluded).
    pub fn deletions_of(&self, handle: &SnapshotHandle) -> u32 {
        self.state().deletions.get(handle).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SnapshotProvider for SimulatedSnapshotProvider {
    async fn create_snapshot(&self, space: SpaceId) -> Result<SnapshotHandle, SpaceError> {
        tokio::time::sleep(self.create_latency).await;

        let mut state = self.state();
        if let Some(reason) = state.create_faults.take() {
            return Err(SpaceError::SnapshotCreationFailed(reason));
        }
        if let Some(cap) = self.capacity {
            if state.live.len() >= cap {
                return Err(SpaceError::SnapshotCreationFailed(
                    "insufficient space in simulated pool".into(),
                ));
            }
        }

        let handle = SnapshotHandle::for_space(space);
        if !state.live.insert(handle.clone()) {
            return Err(SpaceError::SnapshotCreationFailed(format!(
                "snapshot {} already exists",
                handle
            )));
        }
        state.created += 1;
        debug!(snapshot = %handle, "simulated snapshot created");
        Ok(handle)
    }

    async fn delete_snapshot(&self, handle: &SnapshotHandle) -> Result<(), SpaceError> {
        tokio::time::sleep(self.delete_latency).await;

        let mut state = self.state();
        if let Some(reason) = state.delete_faults.take() {
            return Err(SpaceError::SnapshotDeletionFailed(reason));
        }
        if state.live.remove(handle) {
            *state.deletions.entry(handle.clone()).or_default() += 1;
            debug!(snapshot = %handle, "simulated snapshot deleted");
        } else {
            debug!(snapshot = %handle, "simulated snapshot already gone");
        }
        Ok(())
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotHandle>, SpaceError> {
        Ok(self.state().live.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[tokio::test]
    async fn create_list_delete() {
        let provider = SimulatedSnapshotProvider::instant();
        let id = SpaceId::new();
        let handle = provider.create_snapshot(id).await.unwrap();

        assert_eq!(handle.space_id(), Some(id));
        assert_eq!(provider.list_snapshots().await.unwrap(), vec![handle.clone()]);

        provider.delete_snapshot(&handle).await.unwrap();
        assert!(provider.list_snapshots().await.unwrap().is_empty());
        assert_eq!(provider.deletions_of(&handle), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let provider = SimulatedSnapshotProvider::instant();
        let handle = provider.create_snapshot(SpaceId::new()).await.unwrap();

        provider.delete_snapshot(&handle).await.unwrap();
        provider.delete_snapshot(&handle).await.unwrap();
        assert_eq!(provider.deletions_of(&handle), 1);
    }

    #[tokio::test]
    async fn injected_create_failures_are_consumed() {
        let provider = SimulatedSnapshotProvider::instant();
        provider.fail_next_creates(2);

        for _ in 0..2 {
            let err = provider.create_snapshot(SpaceId::new()).await.unwrap_err();
            assert!(matches!(err, SpaceError::SnapshotCreationFailed(_)));
        }
        assert!(provider.create_snapshot(SpaceId::new()).await.is_ok());
        assert_eq!(provider.created_count(), 1);
    }

    #[tokio::test]
    async fn injected_delete_failure_keeps_snapshot() {
        let provider = SimulatedSnapshotProvider::instant();
        let handle = provider.create_snapshot(SpaceId::new()).await.unwrap();
        provider.fail_next_deletes(1);

        assert!(matches!(
            provider.delete_snapshot(&handle).await,
            Err(SpaceError::SnapshotDeletionFailed(_))
        ));
        assert!(provider.contains(&handle));
        provider.delete_snapshot(&handle).await.unwrap();
        assert!(!provider.contains(&handle));
    }

    #[tokio::test]
    async fn capacity_simulates_insufficient_space() {
        let provider = SimulatedSnapshotProvider::instant().with_capacity(1);
        provider.create_snapshot(SpaceId::new()).await.unwrap();
        let err = provider.create_snapshot(SpaceId::new()).await.unwrap_err();
        assert_eq!(
            err,
            SpaceError::SnapshotCreationFailed("insufficient space in simulated pool".into())
        );
    }

    #[tokio::test]
    async fn creation_stays_within_budget() {
        let provider =
            SimulatedSnapshotProvider::new(Duration::from_millis(5), Duration::from_millis(2));
        let started = Instant::now();
        provider.create_snapshot(SpaceId::new()).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn fault_plan_counts_down() {
        let mut plan = FaultPlan::default();
        assert!(plan.take().is_none());
        plan.arm(1, "boom");
        assert_eq!(plan.take().as_deref(), Some("boom"));
        assert!(plan.take().is_none());
    }
}
