//! Best-effort teardown: every step is attempted, every outcome is recorded.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use super::{EphemeralSpace, SpaceId, SpaceRegistry, SpaceState};
use crate::error::{SpaceError, TeardownFailure, TeardownStep};
use crate::events::{EventSink, LifecycleEvent};
use crate::mount::{is_in_use, MountController, UnmountOutcome};
use crate::storage::SnapshotProvider;
use crate::util::millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Done,
    /// Nothing to do: the resource was never acquired or is already gone.
    NotNeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub step: TeardownStep,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub duration_ms: u64,
}

/// Outcome of one teardown pass over a space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub id: SpaceId,
    /// `Destroyed` when every step succeeded, otherwise `Failed`.
    pub final_state: SpaceState,
    pub steps: Vec<StepRecord>,
    pub duration_ms: u64,
}

impl TeardownReport {
    pub fn new(id: SpaceId) -> Self {
        Self {
            id,
            final_state: SpaceState::Destroying,
            steps: Vec::with_capacity(3),
            duration_ms: 0,
        }
    }

    fn record(&mut self, step: TeardownStep, status: StepStatus, reason: Option<String>, took: Duration) {
        self.steps.push(StepRecord {
            step,
            status,
            reason,
            duration_ms: millis(took),
        });
    }

    pub fn status_of(&self, step: TeardownStep) -> Option<StepStatus> {
        self.steps.iter().find(|r| r.step == step).map(|r| r.status)
    }

    pub fn failures(&self) -> Vec<TeardownFailure> {
        self.steps
            .iter()
            .filter(|r| r.status == StepStatus::Failed)
            .map(|r| TeardownFailure {
                step: r.step,
                reason: r.reason.clone().unwrap_or_default(),
            })
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|r| r.status != StepStatus::Failed)
    }

    /// `Ok(self)` when every step succeeded, otherwise `TeardownIncomplete`.
    pub fn into_result(self) -> Result<Self, SpaceError> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(SpaceError::TeardownIncomplete(self.failures()))
        }
    }
}

/// Runs the three teardown steps against the configured backends.
pub(crate) struct Teardown<'a> {
    pub snapshots: &'a dyn SnapshotProvider,
    pub mounts: &'a dyn MountController,
    pub registry: &'a SpaceRegistry,
    pub events: &'a dyn EventSink,
}

impl Teardown<'_> {
    /// Unmount, delete the snapshot, unregister. A failed step never stops
    /// the next one. `unregister` is false on retries, where the record has
    /// already left the registry.
    pub async fn run(&self, space: &EphemeralSpace, unregister: bool) -> TeardownReport {
        let started = Instant::now();
        let mut report = TeardownReport::new(space.id);

        let step_started = Instant::now();
        match &space.mount_path {
            Some(path) => match self.mounts.unmount(path).await {
                Ok(UnmountOutcome::Unmounted) => {
                    report.record(TeardownStep::Unmount, StepStatus::Done, None, step_started.elapsed())
                }
                Ok(UnmountOutcome::AlreadyUnmounted) => report.record(
                    TeardownStep::Unmount,
                    StepStatus::NotNeeded,
                    None,
                    step_started.elapsed(),
                ),
                Err(e) => {
                    warn!(space_id = %space.id, mount = %path.leaf(), error = %e, "unmount failed");
                    if is_in_use(&e) {
                        self.events.emit(LifecycleEvent::SuspiciousActivity {
                            id: space.id,
                            description: format!(
                                "mount point {} still in use at teardown",
                                path.leaf()
                            ),
                        });
                    }
                    report.record(
                        TeardownStep::Unmount,
                        StepStatus::Failed,
                        Some(e.to_string()),
                        step_started.elapsed(),
                    );
                }
            },
            None => report.record(TeardownStep::Unmount, StepStatus::NotNeeded, None, Duration::ZERO),
        }

        let step_started = Instant::now();
        match &space.snapshot {
            Some(handle) => match self.snapshots.delete_snapshot(handle).await {
                Ok(()) => report.record(
                    TeardownStep::DeleteSnapshot,
                    StepStatus::Done,
                    None,
                    step_started.elapsed(),
                ),
                Err(e) => {
                    warn!(space_id = %space.id, snapshot = %handle, error = %e, "snapshot deletion failed");
                    report.record(
                        TeardownStep::DeleteSnapshot,
                        StepStatus::Failed,
                        Some(e.to_string()),
                        step_started.elapsed(),
                    );
                }
            },
            None => report.record(
                TeardownStep::DeleteSnapshot,
                StepStatus::NotNeeded,
                None,
                Duration::ZERO,
            ),
        }

        let step_started = Instant::now();
        if !unregister {
            report.record(TeardownStep::Unregister, StepStatus::NotNeeded, None, Duration::ZERO);
        } else if self.registry.unregister(space.id) {
            report.record(TeardownStep::Unregister, StepStatus::Done, None, step_started.elapsed());
        } else {
            report.record(
                TeardownStep::Unregister,
                StepStatus::Failed,
                Some(SpaceError::SpaceNotFound(space.id).to_string()),
                step_started.elapsed(),
            );
        }

        report.duration_ms = millis(started.elapsed());
        report.final_state = if report.is_complete() {
            SpaceState::Destroyed
        } else {
            SpaceState::Failed
        };
        if report.is_complete() {
            info!(space_id = %space.id, duration_ms = report.duration_ms, "teardown complete");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::events::ChannelSink;
    use crate::mount::SimulatedMountController;
    use crate::space::{OwnerToken, SpaceMetrics};
    use crate::storage::SimulatedSnapshotProvider;

    struct Fixture {
        snapshots: SimulatedSnapshotProvider,
        mounts: SimulatedMountController,
        registry: SpaceRegistry,
        sink: Arc<ChannelSink>,
        rx: tokio::sync::mpsc::UnboundedReceiver<LifecycleEvent>,
    }

    impl Fixture {
        fn new() -> Self {
            let (sink, rx) = ChannelSink::new();
            Self {
                snapshots: SimulatedSnapshotProvider::instant(),
                mounts: SimulatedMountController::instant("/run/zerotrace/spaces"),
                registry: SpaceRegistry::new(4),
                sink: Arc::new(sink),
                rx,
            }
        }

        fn teardown(&self) -> Teardown<'_> {
            Teardown {
                snapshots: &self.snapshots,
                mounts: &self.mounts,
                registry: &self.registry,
                events: self.sink.as_ref(),
            }
        }

        async fn active_space(&self) -> EphemeralSpace {
            let space = EphemeralSpace::reserve(OwnerToken::Session("t".into()));
            let id = space.id;
            self.registry.try_register(space).unwrap();
            let handle = self.snapshots.create_snapshot(id).await.unwrap();
            let path = self.mounts.mount(&handle).await.unwrap();
            self.registry
                .activate(id, handle, path, SpaceMetrics::default())
                .unwrap()
        }
    }

    #[tokio::test]
    async fn complete_teardown_releases_everything() {
        let fx = Fixture::new();
        let space = fx.active_space().await;

        let report = fx.teardown().run(&space, true).await;
        assert!(report.is_complete());
        assert_eq!(report.final_state, SpaceState::Destroyed);
        assert_eq!(report.status_of(TeardownStep::Unmount), Some(StepStatus::Done));
        assert_eq!(report.status_of(TeardownStep::DeleteSnapshot), Some(StepStatus::Done));
        assert_eq!(report.status_of(TeardownStep::Unregister), Some(StepStatus::Done));
        assert_eq!(fx.snapshots.live_count(), 0);
        assert_eq!(fx.mounts.mounted_count(), 0);
        assert!(fx.registry.is_empty());
        assert!(report.into_result().is_ok());
    }

    #[tokio::test]
    async fn failed_unmount_does_not_stop_later_steps() {
        let mut fx = Fixture::new();
        let space = fx.active_space().await;
        let path = space.mount_path.clone().unwrap();
        fx.mounts.mark_busy(&path);

        let report = fx.teardown().run(&space, true).await;
        assert!(!report.is_complete());
        assert_eq!(report.final_state, SpaceState::Failed);
        assert_eq!(report.status_of(TeardownStep::Unmount), Some(StepStatus::Failed));
        assert_eq!(report.status_of(TeardownStep::DeleteSnapshot), Some(StepStatus::Done));
        assert_eq!(report.status_of(TeardownStep::Unregister), Some(StepStatus::Done));

        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].step, TeardownStep::Unmount);

        match fx.rx.try_recv() {
            Ok(LifecycleEvent::SuspiciousActivity { id, description }) => {
                assert_eq!(id, space.id);
                assert!(!description.contains("/run/zerotrace"));
            }
            other => panic!("expected suspicious activity, got {:?}", other),
        }

        assert!(matches!(
            report.into_result(),
            Err(SpaceError::TeardownIncomplete(f)) if f.len() == 1
        ));
    }

    #[tokio::test]
    async fn every_failure_is_aggregated() {
        let fx = Fixture::new();
        let space = fx.active_space().await;
        fx.mounts.mark_busy(space.mount_path.as_ref().unwrap());
        fx.snapshots.fail_next_deletes(1);

        let report = fx.teardown().run(&space, true).await;
        let steps: Vec<_> = report.failures().into_iter().map(|f| f.step).collect();
        assert_eq!(steps, vec![TeardownStep::Unmount, TeardownStep::DeleteSnapshot]);
    }

    #[tokio::test]
    async fn retry_pass_skips_unregister_and_tolerates_gone_resources() {
        let fx = Fixture::new();
        let space = fx.active_space().await;
        assert!(fx.teardown().run(&space, true).await.is_complete());

        let mut stale = space.clone();
        stale.state = SpaceState::Failed;
        let report = fx.teardown().run(&stale, false).await;
        assert!(report.is_complete());
        assert_eq!(report.status_of(TeardownStep::Unmount), Some(StepStatus::NotNeeded));
        assert_eq!(report.status_of(TeardownStep::Unregister), Some(StepStatus::NotNeeded));
        assert_eq!(fx.snapshots.deletions_of(space.snapshot.as_ref().unwrap()), 1);
    }

    #[test]
    fn report_serializes_step_statuses() {
        let mut report = TeardownReport::new(SpaceId::new());
        report.record(
            TeardownStep::DeleteSnapshot,
            StepStatus::Failed,
            Some("busy".into()),
            Duration::from_millis(3),
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["steps"][0]["step"], "delete_snapshot");
        assert_eq!(json["steps"][0]["status"], "failed");
        assert_eq!(json["steps"][0]["duration_ms"], 3);
    }
}
