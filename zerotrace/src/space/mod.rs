pub mod orchestrator;
pub mod registry;
pub mod teardown;
pub mod watchdog;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mount::MountPath;
use crate::storage::SnapshotHandle;

pub use orchestrator::{SpaceOrchestrator, SweepReport};
pub use registry::SpaceRegistry;
pub use teardown::TeardownReport;
pub use watchdog::OwnerWatchdog;

/// Opaque space identifier. Generated once per space and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpaceId(Uuid);

impl SpaceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Short ID (first 8 chars of the UUID) for compact log lines.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SpaceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SpaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Space lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceState {
    Creating,
    Active,
    Destroying,
    Destroyed,
    Failed,
}

impl SpaceState {
    /// States that occupy one of the `max_spaces` slots.
    pub fn counts_toward_capacity(&self) -> bool {
        matches!(self, Self::Creating | Self::Active)
    }
}

impl std::fmt::Display for SpaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Active => write!(f, "active"),
            Self::Destroying => write!(f, "destroying"),
            Self::Destroyed => write!(f, "destroyed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Identifies who requested a space, so their spaces can be reclaimed when
/// they go away.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerToken {
    /// A host process; probed for liveness by the owner watchdog.
    Process(u32),
    /// An opaque session; released explicitly via `destroy_owned_by`.
    Session(String),
}

impl OwnerToken {
    /// Owner token for the calling process.
    pub fn current_process() -> Self {
        Self::Process(std::process::id())
    }
}

impl std::fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process(pid) => write!(f, "pid:{}", pid),
            Self::Session(s) => write!(f, "session:{}", s),
        }
    }
}

/// Timings gathered over a space's lifetime, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceMetrics {
    pub snapshot_ms: u64,
    pub mount_ms: u64,
    /// End-to-end `create()` duration, capacity check through activation.
    pub creation_ms: u64,
    /// Set once teardown has run.
    pub teardown_ms: Option<u64>,
}

/// The record of a single ephemeral space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralSpace {
    pub id: SpaceId,
    pub snapshot: Option<SnapshotHandle>,
    pub mount_path: Option<MountPath>,
    pub state: SpaceState,
    pub created_at: DateTime<Utc>,
    pub owner: OwnerToken,
    pub metrics: SpaceMetrics,
}

impl EphemeralSpace {
    /// A fresh record in `Creating` state, holding no resources yet.
    pub fn reserve(owner: OwnerToken) -> Self {
        Self {
            id: SpaceId::new(),
            snapshot: None,
            mount_path: None,
            state: SpaceState::Creating,
            created_at: Utc::now(),
            owner,
            metrics: SpaceMetrics::default(),
        }
    }

    pub fn handle(&self) -> Option<SpaceHandle> {
        match (&self.mount_path, self.state) {
            (Some(path), SpaceState::Active) => Some(SpaceHandle {
                id: self.id,
                mount_path: path.clone(),
            }),
            _ => None,
        }
    }
}

/// What callers get back from `create()`: enough to run something inside
/// the space and to destroy it later, nothing they could mutate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpaceHandle {
    id: SpaceId,
    mount_path: MountPath,
}

impl SpaceHandle {
    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn mount_path(&self) -> &MountPath {
        &self.mount_path
    }
}
