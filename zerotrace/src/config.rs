use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::events::EventSink;
use crate::mount::{HostMountController, MountController, SimulatedMountController};
use crate::space::SpaceOrchestrator;
use crate::storage::{SimulatedSnapshotProvider, SnapshotProvider, Zfs, ZfsSnapshotProvider};

/// Top-level configuration for zerotrace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub space: SpaceConfig,
    pub storage: StorageConfig,
    pub simulated: SimulatedConfig,
    pub watchdog: WatchdogConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.space.max_spaces >= 1, "space.max_spaces must be >= 1");
        anyhow::ensure!(
            self.space.creation_budget_ms >= 1,
            "space.creation_budget_ms must be >= 1"
        );
        anyhow::ensure!(self.space.mount_budget_ms >= 1, "space.mount_budget_ms must be >= 1");
        anyhow::ensure!(
            self.space.teardown_budget_ms >= 1,
            "space.teardown_budget_ms must be >= 1"
        );
        for (field, value) in [
            ("storage.zfs_pool", &self.storage.zfs_pool),
            ("storage.dataset_prefix", &self.storage.dataset_prefix),
            ("storage.source_dataset", &self.storage.source_dataset),
        ] {
            anyhow::ensure!(!value.is_empty(), "{} must not be empty", field);
            anyhow::ensure!(
                !value.contains('@') && !value.starts_with('/') && !value.ends_with('/'),
                "{} is not a valid dataset name: {}",
                field,
                value
            );
        }
        anyhow::ensure!(
            self.storage.mount_root.is_absolute(),
            "storage.mount_root must be an absolute path"
        );
        anyhow::ensure!(
            self.storage.mount_root != Path::new("/"),
            "storage.mount_root must not be the filesystem root"
        );
        anyhow::ensure!(
            self.watchdog.interval_secs >= 1,
            "watchdog.interval_secs must be >= 1"
        );
        Ok(())
    }

    /// Build an orchestrator over the backend selected by `space.test_mode`.
    pub fn orchestrator(&self, events: Arc<dyn EventSink>) -> SpaceOrchestrator {
        let (snapshots, mounts): (Arc<dyn SnapshotProvider>, Arc<dyn MountController>) =
            if self.space.test_mode {
                let sim = &self.simulated;
                (
                    Arc::new(SimulatedSnapshotProvider::new(
                        sim.snapshot_latency(),
                        sim.delete_latency(),
                    )),
                    Arc::new(SimulatedMountController::new(
                        self.storage.mount_root.clone(),
                        sim.mount_latency(),
                        sim.unmount_latency(),
                    )),
                )
            } else {
                let zfs = self.storage.zfs();
                (
                    Arc::new(ZfsSnapshotProvider::new(zfs.clone())),
                    Arc::new(HostMountController::new(
                        self.storage.mount_root.clone(),
                        zfs,
                    )),
                )
            };
        SpaceOrchestrator::new(self.space.clone(), snapshots, mounts, events)
    }
}

/// Capacity and performance budgets for spaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceConfig {
    /// Maximum spaces that may be creating or active at once.
    pub max_spaces: usize,
    /// Use the deterministic simulated backend instead of ZFS and mount(8).
    pub test_mode: bool,
    /// Budget for a whole `create()`; exceeding it only raises an anomaly event.
    pub creation_budget_ms: u64,
    /// Budget for mounting a snapshot.
    pub mount_budget_ms: u64,
    /// Budget for a whole teardown (unmount, delete, unregister).
    pub teardown_budget_ms: u64,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            max_spaces: 10,
            test_mode: false,
            creation_budget_ms: 100,
            mount_budget_ms: 50,
            teardown_budget_ms: 200,
        }
    }
}

impl SpaceConfig {
    pub fn creation_budget(&self) -> Duration {
        Duration::from_millis(self.creation_budget_ms)
    }

    pub fn mount_budget(&self) -> Duration {
        Duration::from_millis(self.mount_budget_ms)
    }

    pub fn teardown_budget(&self) -> Duration {
        Duration::from_millis(self.teardown_budget_ms)
    }
}

/// ZFS and mount layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// ZFS pool name (e.g. "zerotrace").
    pub zfs_pool: String,
    /// Dataset prefix under the pool (e.g. "zerotrace").
    pub dataset_prefix: String,
    /// Dataset every space is snapshotted from, relative to pool/prefix.
    pub source_dataset: String,
    /// Private directory under which spaces are mounted.
    pub mount_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            zfs_pool: "zerotrace".into(),
            dataset_prefix: "zerotrace".into(),
            source_dataset: "base".into(),
            mount_root: PathBuf::from("/run/zerotrace/spaces"),
        }
    }
}

impl StorageConfig {
    /// Pool root for zerotrace datasets, e.g. "zerotrace/zerotrace".
    pub fn pool_root(&self) -> String {
        format!("{}/{}", self.zfs_pool, self.dataset_prefix)
    }

    /// Full dataset path of the source, e.g. "zerotrace/zerotrace/base".
    pub fn source_dataset_path(&self) -> String {
        format!("{}/{}", self.pool_root(), self.source_dataset)
    }

    pub fn zfs(&self) -> Zfs {
        Zfs::new(self.pool_root(), self.source_dataset_path())
    }
}

/// Latencies of the simulated backend, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedConfig {
    pub snapshot_latency_ms: u64,
    pub delete_latency_ms: u64,
    pub mount_latency_ms: u64,
    pub unmount_latency_ms: u64,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            snapshot_latency_ms: 5,
            delete_latency_ms: 3,
            mount_latency_ms: 2,
            unmount_latency_ms: 2,
        }
    }
}

impl SimulatedConfig {
    pub fn snapshot_latency(&self) -> Duration {
        Duration::from_millis(self.snapshot_latency_ms)
    }

    pub fn delete_latency(&self) -> Duration {
        Duration::from_millis(self.delete_latency_ms)
    }

    pub fn mount_latency(&self) -> Duration {
        Duration::from_millis(self.mount_latency_ms)
    }

    pub fn unmount_latency(&self) -> Duration {
        Duration::from_millis(self.unmount_latency_ms)
    }
}

/// Owner watchdog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Seconds between owner liveness probes.
    pub interval_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { interval_secs: 2 }
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
