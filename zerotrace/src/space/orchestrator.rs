use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use super::teardown::Teardown;
use super::{
    EphemeralSpace, OwnerToken, SpaceHandle, SpaceId, SpaceMetrics, SpaceRegistry, SpaceState,
    TeardownReport,
};
use crate::config::SpaceConfig;
use crate::error::{CreateStep, SpaceError, TeardownStep};
use crate::events::{BudgetedPhase, EventSink, LifecycleEvent};
use crate::metrics::MetricsRegistry;
use crate::mount::{MountController, MountPath};
use crate::storage::{SnapshotHandle, SnapshotProvider};
use crate::util::millis;

/// Result of a crash-recovery sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Orphans were only listed, nothing was touched.
    pub dry_run: bool,
    /// Queued teardowns that completed during the sweep.
    pub retried: usize,
    pub orphan_mounts: Vec<MountPath>,
    pub orphan_snapshots: Vec<SnapshotHandle>,
    /// Orphans actually released (mounts plus snapshots).
    pub reclaimed: usize,
    pub failures: Vec<String>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Owns the space lifecycle: creation with rollback, best-effort teardown,
/// the retry queue, and crash-recovery reconciliation.
///
/// Cheap to clone; clones share the same registry and backends. Every
/// lifecycle operation runs in its own spawned task, so dropping the
/// caller's future never interrupts a rollback or a teardown halfway.
#[derive(Clone)]
pub struct SpaceOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: SpaceConfig,
    registry: SpaceRegistry,
    snapshots: Arc<dyn SnapshotProvider>,
    mounts: Arc<dyn MountController>,
    events: Arc<dyn EventSink>,
    metrics: MetricsRegistry,
    /// Held shared by create/destroy/retry, exclusively by the sweep and
    /// shutdown.
    gate: RwLock<()>,
    /// Records whose teardown left something behind. Never dropped until a
    /// retry succeeds.
    retry_queue: Mutex<HashMap<SpaceId, EphemeralSpace>>,
}

impl std::fmt::Debug for SpaceOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceOrchestrator")
            .field("max_spaces", &self.inner.config.max_spaces)
            .field("live", &self.inner.registry.live_count())
            .field("snapshots", &self.inner.snapshots)
            .field("mounts", &self.inner.mounts)
            .finish_non_exhaustive()
    }
}

impl SpaceOrchestrator {
    pub fn new(
        config: SpaceConfig,
        snapshots: Arc<dyn SnapshotProvider>,
        mounts: Arc<dyn MountController>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self::with_metrics(config, snapshots, mounts, events, MetricsRegistry::new())
    }

    pub fn with_metrics(
        config: SpaceConfig,
        snapshots: Arc<dyn SnapshotProvider>,
        mounts: Arc<dyn MountController>,
        events: Arc<dyn EventSink>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: SpaceRegistry::new(config.max_spaces),
                config,
                snapshots,
                mounts,
                events,
                metrics,
                gate: RwLock::new(()),
                retry_queue: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Run `op` on a detached task and wait for it.
    async fn detached<T, F>(&self, op: impl FnOnce(Arc<Inner>) -> F) -> Result<T, SpaceError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(op(Arc::clone(&self.inner)))
            .await
            .map_err(|e| {
                error!(error = %e, "lifecycle task terminated abnormally");
                SpaceError::Internal(format!("lifecycle task terminated abnormally: {}", e))
            })
    }

    /// Create a space: reserve capacity, snapshot, mount, activate.
    ///
    /// Any failure rolls back whatever was already acquired before the
    /// error returns.
    #[instrument(skip(self))]
    pub async fn create(&self, owner: OwnerToken) -> Result<SpaceHandle, SpaceError> {
        self.detached(|inner| async move { inner.create(owner).await })
            .await?
    }

    /// Tear down a space: unmount, delete its snapshot, unregister.
    ///
    /// Every step is attempted. If any fail, the record moves to the retry
    /// queue and `TeardownIncomplete` lists the failed steps.
    #[instrument(skip(self), fields(space_id = %id))]
    pub async fn destroy(&self, id: SpaceId) -> Result<TeardownReport, SpaceError> {
        self.detached(move |inner| async move {
            let _gate = inner.gate.read().await;
            inner.destroy_locked(id).await
        })
        .await??
        .into_result()
    }

    /// Destroy every active space belonging to `owner`.
    #[instrument(skip(self))]
    pub async fn destroy_owned_by(&self, owner: &OwnerToken) -> Result<Vec<TeardownReport>, SpaceError> {
        let owner = owner.clone();
        self.detached(move |inner| async move {
            let _gate = inner.gate.read().await;
            let mut reports = Vec::new();
            for id in inner.registry.owned_by(&owner) {
                match inner.destroy_locked(id).await {
                    Ok(report) => reports.push(report),
                    // A concurrent destroy got there first
                    Err(e) => debug!(space_id = %id, error = %e, "skipping owned space"),
                }
            }
            if !reports.is_empty() {
                info!(owner = %owner, count = reports.len(), "released spaces of owner");
            }
            reports
        })
        .await
    }

    /// Reconcile the host against the registry: drain the retry queue, then
    /// unmount every untracked mount point and delete every untracked
    /// snapshot.
    #[instrument(skip(self))]
    pub async fn recovery_sweep(&self) -> Result<SweepReport, SpaceError> {
        self.detached(|inner| async move {
            let _gate = inner.gate.write().await;
            inner.sweep_locked(false).await
        })
        .await?
    }

    /// List what a sweep would reclaim without touching anything.
    pub async fn find_orphans(&self) -> Result<SweepReport, SpaceError> {
        self.detached(|inner| async move {
            let _gate = inner.gate.write().await;
            inner.sweep_locked(true).await
        })
        .await?
    }

    /// Re-run teardown for every queued record.
    #[instrument(skip(self))]
    pub async fn retry_failed(&self) -> Result<Vec<TeardownReport>, SpaceError> {
        self.detached(|inner| async move {
            let _gate = inner.gate.read().await;
            inner.retry_locked().await
        })
        .await
    }

    /// Wait for in-flight operations, then destroy every active space and
    /// retry the queue.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<Vec<TeardownReport>, SpaceError> {
        self.detached(|inner| async move {
            let _gate = inner.gate.write().await;
            let mut reports = Vec::new();
            let active: Vec<SpaceId> = inner
                .registry
                .all()
                .into_iter()
                .filter(|s| s.state == SpaceState::Active)
                .map(|s| s.id)
                .collect();
            for id in active {
                match inner.destroy_locked(id).await {
                    Ok(report) => reports.push(report),
                    Err(e) => debug!(space_id = %id, error = %e, "space vanished during shutdown"),
                }
            }
            reports.extend(inner.retry_locked().await);
            let incomplete = reports.iter().filter(|r| !r.is_complete()).count();
            info!(destroyed = reports.len() - incomplete, incomplete, "shutdown complete");
            reports
        })
        .await
    }

    pub fn get(&self, id: SpaceId) -> Option<EphemeralSpace> {
        self.inner.registry.lookup(id)
    }

    pub fn list(&self) -> Vec<EphemeralSpace> {
        self.inner.registry.all()
    }

    pub fn live_count(&self) -> usize {
        self.inner.registry.live_count()
    }

    /// Records waiting for a teardown retry, in state `Failed`.
    pub fn pending_retries(&self) -> Vec<EphemeralSpace> {
        self.inner.queued()
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.inner.metrics
    }

}

/// Releases a create's reservation if the create body unwinds before it
/// either activated the space or rolled it back. A snapshot it already
/// attached goes to the retry queue; an untracked mount is left to the sweep.
struct Reservation<'a> {
    inner: &'a Inner,
    id: SpaceId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let Some(mut space) = self.inner.registry.remove_creating(self.id) else {
            return;
        };
        error!(space_id = %self.id, "create aborted, releasing its reservation");
        if space.snapshot.is_some() {
            space.state = SpaceState::Failed;
            self.inner.queue().insert(space.id, space);
        }
        self.inner.refresh_live();
    }
}

impl Inner {
    fn teardown(&self) -> Teardown<'_> {
        Teardown {
            snapshots: self.snapshots.as_ref(),
            mounts: self.mounts.as_ref(),
            registry: &self.registry,
            events: self.events.as_ref(),
        }
    }

    fn queue(&self) -> MutexGuard<'_, HashMap<SpaceId, EphemeralSpace>> {
        self.retry_queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queued(&self) -> Vec<EphemeralSpace> {
        self.queue().values().cloned().collect()
    }

    fn take_queued(&self) -> Vec<EphemeralSpace> {
        self.queue().drain().map(|(_, space)| space).collect()
    }

    fn refresh_live(&self) {
        self.metrics.set_live(self.registry.live_count());
    }

    fn check_budget(&self, id: SpaceId, phase: BudgetedPhase, observed: Duration, budget: Duration) {
        if observed <= budget {
            return;
        }
        let observed_ms = millis(observed);
        let budget_ms = millis(budget);
        warn!(space_id = %id, phase = %phase, observed_ms, budget_ms, "performance budget exceeded");
        self.metrics.record_anomaly(phase);
        self.events.emit(LifecycleEvent::PerformanceAnomaly {
            id,
            step: phase,
            observed_duration_ms: observed_ms,
            budget_ms,
        });
    }

    fn creation_failed(&self, step: CreateStep, err: SpaceError) -> SpaceError {
        warn!(step = %step, error = %err, "space creation failed");
        self.metrics.record_create_failure(step);
        self.events.emit(LifecycleEvent::SpaceCreationFailed {
            reason: err.to_string(),
            step_failed: step,
        });
        err
    }

    async fn create(&self, owner: OwnerToken) -> Result<SpaceHandle, SpaceError> {
        let _gate = self.gate.read().await;
        let started = Instant::now();

        // 1. Reserve a slot
        let mut record = EphemeralSpace::reserve(owner);
        let id = record.id;
        if let Err(e) = self.registry.try_register(record.clone()) {
            return Err(self.creation_failed(CreateStep::Capacity, e));
        }
        let _reservation = Reservation { inner: self, id };
        self.refresh_live();

        // 2. Snapshot
        let step_started = Instant::now();
        let snapshot = match self.snapshots.create_snapshot(id).await {
            Ok(handle) => handle,
            Err(e) => {
                self.roll_back(record).await;
                return Err(self.creation_failed(CreateStep::Snapshot, e));
            }
        };
        let snapshot_ms = millis(step_started.elapsed());
        record.snapshot = Some(snapshot.clone());
        if let Err(e) = self.registry.attach_snapshot(id, snapshot.clone()) {
            self.roll_back(record).await;
            return Err(self.creation_failed(CreateStep::Register, e));
        }
        debug!(space_id = %id, snapshot = %snapshot, snapshot_ms, "snapshot ready");

        // 3. Mount
        let step_started = Instant::now();
        let mount_path = match self.mounts.mount(&snapshot).await {
            Ok(path) => path,
            Err(e) => {
                self.roll_back(record).await;
                return Err(self.creation_failed(CreateStep::Mount, e));
            }
        };
        let mount_elapsed = step_started.elapsed();
        record.mount_path = Some(mount_path.clone());
        self.check_budget(id, BudgetedPhase::Mount, mount_elapsed, self.config.mount_budget());

        // 4. Activate
        let metrics = SpaceMetrics {
            snapshot_ms,
            mount_ms: millis(mount_elapsed),
            creation_ms: millis(started.elapsed()),
            teardown_ms: None,
        };
        let space = match self.registry.activate(id, snapshot, mount_path, metrics) {
            Ok(space) => space,
            Err(e) => {
                self.roll_back(record).await;
                return Err(self.creation_failed(CreateStep::Register, e));
            }
        };

        let elapsed = started.elapsed();
        self.check_budget(id, BudgetedPhase::Creation, elapsed, self.config.creation_budget());
        self.metrics.record_creation(elapsed);
        self.events.emit(LifecycleEvent::SpaceCreated {
            id,
            creation_duration_ms: millis(elapsed),
        });
        info!(space_id = %id, owner = %space.owner, creation_ms = millis(elapsed), "space active");

        space
            .handle()
            .ok_or_else(|| SpaceError::Internal(format!("space {} activated without a mount", id)))
    }

    /// Release whatever a failed create acquired. Anything that cannot be
    /// released goes to the retry queue.
    async fn roll_back(&self, record: EphemeralSpace) {
        let report = self.teardown().run(&record, true).await;
        // The reservation may already be gone; only leaked resources matter
        let leaked = report
            .failures()
            .iter()
            .any(|f| f.step != TeardownStep::Unregister);
        if leaked {
            self.enqueue_retry(record, &report);
        } else {
            debug!(space_id = %record.id, "creation rolled back");
        }
        self.refresh_live();
    }

    async fn destroy_locked(&self, id: SpaceId) -> Result<TeardownReport, SpaceError> {
        let space = self.registry.begin_destroy(id)?;
        self.refresh_live();
        Ok(self.finish_teardown(space, true).await)
    }

    async fn finish_teardown(&self, space: EphemeralSpace, unregister: bool) -> TeardownReport {
        let started = Instant::now();
        let report = self.teardown().run(&space, unregister).await;
        let elapsed = started.elapsed();

        self.check_budget(space.id, BudgetedPhase::Teardown, elapsed, self.config.teardown_budget());
        self.metrics.record_teardown(elapsed);
        if report.is_complete() {
            self.events.emit(LifecycleEvent::SpaceDestroyed {
                id: space.id,
                teardown_duration_ms: millis(elapsed),
            });
        } else {
            for failure in report.failures() {
                self.metrics.record_teardown_failure(failure.step);
            }
            self.enqueue_retry(space, &report);
        }
        self.refresh_live();
        report
    }

    fn enqueue_retry(&self, mut space: EphemeralSpace, report: &TeardownReport) {
        use super::teardown::StepStatus;

        // Only keep the resources that are still held
        if report.status_of(TeardownStep::Unmount) != Some(StepStatus::Failed) {
            space.mount_path = None;
        }
        if report.status_of(TeardownStep::DeleteSnapshot) != Some(StepStatus::Failed) {
            space.snapshot = None;
        }
        space.state = SpaceState::Failed;
        space.metrics.teardown_ms = Some(report.duration_ms);

        let failures: Vec<String> = report.failures().iter().map(|f| f.to_string()).collect();
        error!(space_id = %space.id, failures = %failures.join("; "), "teardown incomplete, queued for retry");
        self.queue().insert(space.id, space);
    }

    async fn retry_locked(&self) -> Vec<TeardownReport> {
        let pending = self.take_queued();
        if pending.is_empty() {
            return Vec::new();
        }
        info!(count = pending.len(), "retrying failed teardowns");
        let mut reports = Vec::with_capacity(pending.len());
        for space in pending {
            reports.push(self.finish_teardown(space, false).await);
        }
        reports
    }

    fn report_orphan(&self, id: Option<SpaceId>, seen: &mut HashSet<SpaceId>, what: &str) {
        if let Some(id) = id {
            if seen.insert(id) {
                self.events.emit(LifecycleEvent::SuspiciousActivity {
                    id,
                    description: format!("orphaned {} reclaimed by recovery sweep", what),
                });
            }
        }
    }

    async fn sweep_locked(&self, dry_run: bool) -> Result<SweepReport, SpaceError> {
        let mut report = SweepReport {
            dry_run,
            ..SweepReport::default()
        };

        if !dry_run {
            for retry in self.retry_locked().await {
                if retry.is_complete() {
                    report.retried += 1;
                } else {
                    report.failures.extend(
                        retry
                            .failures()
                            .iter()
                            .map(|f| format!("space {}: {}", retry.id.short(), f)),
                    );
                }
            }
        }

        let mut known_snapshots = self.registry.tracked_snapshots();
        let mut known_mounts = self.registry.tracked_mounts();
        for space in self.queued() {
            known_snapshots.extend(space.snapshot);
            known_mounts.extend(space.mount_path);
        }

        report.orphan_mounts = self
            .mounts
            .list_mounts()
            .await?
            .into_iter()
            .filter(|m| !known_mounts.contains(m))
            .collect();
        report.orphan_snapshots = self
            .snapshots
            .list_snapshots()
            .await?
            .into_iter()
            .filter(|s| !known_snapshots.contains(s))
            .collect();

        if dry_run {
            info!(
                mounts = report.orphan_mounts.len(),
                snapshots = report.orphan_snapshots.len(),
                "orphans found (dry run)"
            );
            return Ok(report);
        }

        // Mounts first: a snapshot cannot be destroyed while its clone is mounted
        let mut seen = HashSet::new();
        for path in &report.orphan_mounts {
            match self.mounts.unmount(path).await {
                Ok(_) => {
                    report.reclaimed += 1;
                    let id = SnapshotHandle::parse(&path.leaf()).and_then(|h| h.space_id());
                    self.report_orphan(id, &mut seen, "mount");
                }
                Err(e) => {
                    warn!(mount = %path.leaf(), error = %e, "failed to reclaim orphaned mount");
                    report.failures.push(format!("mount {}: {}", path.leaf(), e));
                }
            }
        }
        for handle in &report.orphan_snapshots {
            match self.snapshots.delete_snapshot(handle).await {
                Ok(()) => {
                    report.reclaimed += 1;
                    self.report_orphan(handle.space_id(), &mut seen, "snapshot");
                }
                Err(e) => {
                    warn!(snapshot = %handle, error = %e, "failed to reclaim orphaned snapshot");
                    report.failures.push(format!("snapshot {}: {}", handle, e));
                }
            }
        }

        self.metrics
            .record_orphans_reclaimed(u64::try_from(report.reclaimed).unwrap_or(u64::MAX));
        info!(
            retried = report.retried,
            reclaimed = report.reclaimed,
            failures = report.failures.len(),
            "recovery sweep complete"
        );
        Ok(report)
    }
}
