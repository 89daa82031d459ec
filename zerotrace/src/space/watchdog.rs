use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{OwnerToken, SpaceOrchestrator, SpaceState};
use crate::config::WatchdogConfig;
use crate::error::SpaceError;

/// Decides whether the process with the given pid still exists.
pub type LivenessProbe = Arc<dyn Fn(u32) -> bool + Send + Sync>;

/// Reclaims spaces whose owning process has gone away.
///
/// Session-owned spaces are never touched here; they are released with
/// [`SpaceOrchestrator::destroy_owned_by`].
pub struct OwnerWatchdog {
    orchestrator: SpaceOrchestrator,
    probe: LivenessProbe,
}

impl OwnerWatchdog {
    pub fn new(orchestrator: SpaceOrchestrator) -> Self {
        Self::with_probe(orchestrator, process_alive)
    }

    pub fn with_probe(
        orchestrator: SpaceOrchestrator,
        probe: impl Fn(u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            orchestrator,
            probe: Arc::new(probe),
        }
    }

    /// One pass: destroy the spaces of every dead owner, then retry any
    /// queued teardowns. Returns how many spaces were fully reclaimed.
    pub async fn check_once(&self) -> Result<usize, SpaceError> {
        let dead: HashSet<u32> = self
            .orchestrator
            .list()
            .into_iter()
            .filter(|s| s.state == SpaceState::Active)
            .filter_map(|s| match s.owner {
                OwnerToken::Process(pid) => Some(pid),
                OwnerToken::Session(_) => None,
            })
            .filter(|pid| !(self.probe)(*pid))
            .collect();

        let mut reclaimed = 0;
        for pid in dead {
            info!(pid, "owner process exited, releasing its spaces");
            let reports = self
                .orchestrator
                .destroy_owned_by(&OwnerToken::Process(pid))
                .await?;
            reclaimed += reports.iter().filter(|r| r.is_complete()).count();
        }

        if !self.orchestrator.pending_retries().is_empty() {
            let reports = self.orchestrator.retry_failed().await?;
            reclaimed += reports.iter().filter(|r| r.is_complete()).count();
        }
        Ok(reclaimed)
    }

    /// Spawn a watchdog that probes real processes every
    /// `config.interval_secs`.
    pub fn start(orchestrator: SpaceOrchestrator, config: &WatchdogConfig) -> JoinHandle<()> {
        Self::new(orchestrator).spawn(config.interval())
    }

    /// Run [`check_once`](Self::check_once) every `interval` until the
    /// returned task is aborted.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match self.check_once().await {
                    Ok(0) => {}
                    Ok(reclaimed) => debug!(reclaimed, "owner watchdog pass"),
                    Err(e) => warn!(error = %e, "owner watchdog pass failed"),
                }
            }
        })
    }
}

/// `kill(pid, 0)` existence check. A process we may not signal still exists.
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // 0 and negatives address process groups
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpaceConfig;
    use crate::events::TracingSink;
    use crate::mount::SimulatedMountController;
    use crate::storage::SimulatedSnapshotProvider;

    fn orchestrator() -> (SpaceOrchestrator, Arc<SimulatedMountController>) {
        let mounts = Arc::new(SimulatedMountController::instant("/run/zerotrace/spaces"));
        let orchestrator = SpaceOrchestrator::new(
            SpaceConfig::default(),
            Arc::new(SimulatedSnapshotProvider::instant()),
            Arc::clone(&mounts) as Arc<dyn crate::mount::MountController>,
            Arc::new(TracingSink),
        );
        (orchestrator, mounts)
    }

    #[test]
    fn current_process_is_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(0));
        assert!(!process_alive(u32::MAX));
    }

    #[tokio::test]
    async fn dead_owners_are_reclaimed() {
        let (orchestrator, _) = orchestrator();
        orchestrator.create(OwnerToken::Process(999)).await.unwrap();
        orchestrator.create(OwnerToken::Process(999)).await.unwrap();
        let alive = orchestrator.create(OwnerToken::Process(1000)).await.unwrap();
        let session = orchestrator
            .create(OwnerToken::Session("s".into()))
            .await
            .unwrap();

        let watchdog = OwnerWatchdog::with_probe(orchestrator.clone(), |pid| pid != 999);
        assert_eq!(watchdog.check_once().await.unwrap(), 2);

        let mut remaining: Vec<_> = orchestrator.list().into_iter().map(|s| s.id).collect();
        remaining.sort();
        let mut expected = vec![alive.id(), session.id()];
        expected.sort();
        assert_eq!(remaining, expected);

        // Nothing left to do
        assert_eq!(watchdog.check_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn watchdog_drains_retry_queue() {
        let (orchestrator, mounts) = orchestrator();
        let handle = orchestrator
            .create(OwnerToken::Session("s".into()))
            .await
            .unwrap();
        mounts.mark_busy(handle.mount_path());
        assert!(orchestrator.destroy(handle.id()).await.is_err());
        mounts.release(handle.mount_path());

        let watchdog = OwnerWatchdog::with_probe(orchestrator.clone(), |_| true);
        assert_eq!(watchdog.check_once().await.unwrap(), 1);
        assert!(orchestrator.pending_retries().is_empty());
    }

    #[tokio::test]
    async fn configured_watchdog_reclaims_exited_processes() {
        let (orchestrator, _) = orchestrator();
        // Not a valid pid_t, so never alive
        orchestrator.create(OwnerToken::Process(u32::MAX)).await.unwrap();
        let mine = orchestrator
            .create(OwnerToken::Process(std::process::id()))
            .await
            .unwrap();

        let config = WatchdogConfig { interval_secs: 1 };
        let task = OwnerWatchdog::start(orchestrator.clone(), &config);
        for _ in 0..100 {
            if orchestrator.live_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();

        let remaining: Vec<_> = orchestrator.list().into_iter().map(|s| s.id).collect();
        assert_eq!(remaining, vec![mine.id()]);
    }

    #[tokio::test]
    async fn spawned_watchdog_runs_periodically() {
        let (orchestrator, _) = orchestrator();
        orchestrator.create(OwnerToken::Process(77)).await.unwrap();

        let task = OwnerWatchdog::with_probe(orchestrator.clone(), |_| false)
            .spawn(Duration::from_millis(10));
        for _ in 0..100 {
            if orchestrator.live_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();
        assert_eq!(orchestrator.live_count(), 0);
    }
}
