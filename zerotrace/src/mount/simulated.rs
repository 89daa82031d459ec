//! Deterministic in-memory mount backend for tests and `test_mode`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{MountController, MountPath, UnmountOutcome, IN_USE};
use crate::error::SpaceError;
use crate::storage::simulated::FaultPlan;
use crate::storage::SnapshotHandle;

#[derive(Debug, Default)]
struct SimState {
    /// Mount point directories that exist, mounted or not.
    points: BTreeSet<MountPath>,
    mounted: BTreeMap<MountPath, SnapshotHandle>,
    busy: BTreeSet<MountPath>,
    mount_faults: FaultPlan,
    unmounts: HashMap<MountPath, u32>,
}

#[derive(Debug)]
pub struct SimulatedMountController {
    root: PathBuf,
    mount_latency: Duration,
    unmount_latency: Duration,
    state: Mutex<SimState>,
}

impl SimulatedMountController {
    pub fn new(root: impl Into<PathBuf>, mount_latency: Duration, unmount_latency: Duration) -> Self {
        Self {
            root: root.into(),
            mount_latency,
            unmount_latency,
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn instant(root: impl Into<PathBuf>) -> Self {
        Self::new(root, Duration::ZERO, Duration::ZERO)
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_next_mounts(&self, count: usize) {
        self.state().mount_faults.arm(count, "injected mount failure");
    }

    /// Pretend another process holds `path` open; unmounting it fails until
    /// [`release`](Self::release) is called.
    pub fn mark_busy(&self, path: &MountPath) {
        self.state().busy.insert(path.clone());
    }

    pub fn release(&self, path: &MountPath) {
        self.state().busy.remove(path);
    }

    /// Plant a mount nobody tracks, as a crashed session would leave behind.
    pub fn insert_orphan(&self, handle: &SnapshotHandle) -> MountPath {
        let path = MountPath::for_snapshot(&self.root, handle);
        let mut state = self.state();
        state.points.insert(path.clone());
        state.mounted.insert(path.clone(), handle.clone());
        path
    }

    pub fn is_mounted(&self, path: &MountPath) -> bool {
        self.state().mounted.contains_key(path)
    }

    pub fn mounted_count(&self) -> usize {
        self.state().mounted.len()
    }

    /// Mount point directories that exist, whether mounted or not.
    pub fn mount_points(&self) -> Vec<MountPath> {
        self.state().points.iter().cloned().collect()
    }

    /// How many times `path` was actually unmounted.
    pub fn unmounts_of(&self, path: &MountPath) -> u32 {
        self.state().unmounts.get(path).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MountController for SimulatedMountController {
    async fn mount(&self, snapshot: &SnapshotHandle) -> Result<MountPath, SpaceError> {
        let path = MountPath::for_snapshot(&self.root, snapshot);
        {
            let mut state = self.state();
            if !state.points.insert(path.clone()) {
                return Err(SpaceError::MountFailed(format!(
                    "mount point for {} already exists",
                    snapshot
                )));
            }
        }

        tokio::time::sleep(self.mount_latency).await;

        let mut state = self.state();
        if let Some(reason) = state.mount_faults.take() {
            // Release the partially created mount point
            state.points.remove(&path);
            return Err(SpaceError::MountFailed(reason));
        }
        state.mounted.insert(path.clone(), snapshot.clone());
        debug!(mount = %path.leaf(), "simulated mount");
        Ok(path)
    }

    async fn unmount(&self, path: &MountPath) -> Result<UnmountOutcome, SpaceError> {
        tokio::time::sleep(self.unmount_latency).await;

        let mut state = self.state();
        if state.busy.contains(path) {
            return Err(SpaceError::UnmountFailed(format!(
                "mount point {} is {}",
                path.leaf(),
                IN_USE
            )));
        }
        let was_mounted = state.mounted.remove(path).is_some();
        state.points.remove(path);
        if was_mounted {
            *state.unmounts.entry(path.clone()).or_default() += 1;
            debug!(mount = %path.leaf(), "simulated unmount");
            Ok(UnmountOutcome::Unmounted)
        } else {
            Ok(UnmountOutcome::AlreadyUnmounted)
        }
    }

    async fn list_mounts(&self) -> Result<Vec<MountPath>, SpaceError> {
        Ok(self.mount_points())
    }
}
