use serde::Serialize;
use thiserror::Error;

use crate::space::SpaceId;

/// Step of the creation protocol, reported in `spaceCreationFailed` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CreateStep {
    Capacity,
    Snapshot,
    Mount,
    Register,
}

impl std::fmt::Display for CreateStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Capacity => write!(f, "capacity"),
            Self::Snapshot => write!(f, "snapshot"),
            Self::Mount => write!(f, "mount"),
            Self::Register => write!(f, "register"),
        }
    }
}

/// Step of the teardown protocol. Every step is attempted on destroy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownStep {
    Unmount,
    DeleteSnapshot,
    Unregister,
}

impl std::fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unmount => write!(f, "unmount"),
            Self::DeleteSnapshot => write!(f, "delete_snapshot"),
            Self::Unregister => write!(f, "unregister"),
        }
    }
}

/// One failed step of a best-effort teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownFailure {
    pub step: TeardownStep,
    pub reason: String,
}

impl std::fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.step, self.reason)
    }
}

/// Errors surfaced by the space lifecycle.
///
/// Messages carry metadata only. Provider implementations redact host paths
/// before constructing a variant, so these are safe to log verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpaceError {
    #[error("space limit reached: {limit} spaces already live")]
    MaxSpacesExceeded { limit: usize },

    #[error("snapshot creation failed: {0}")]
    SnapshotCreationFailed(String),

    #[error("snapshot deletion failed: {0}")]
    SnapshotDeletionFailed(String),

    #[error("snapshot listing failed: {0}")]
    SnapshotListFailed(String),

    #[error("mount failed: {0}")]
    MountFailed(String),

    #[error("unmount failed: {0}")]
    UnmountFailed(String),

    #[error("mount listing failed: {0}")]
    MountListFailed(String),

    #[error("space {0} not found")]
    SpaceNotFound(SpaceId),

    #[error("teardown incomplete: {}", format_failures(.0))]
    TeardownIncomplete(Vec<TeardownFailure>),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SpaceError {
    /// Whether the caller may retry later with a reasonable chance of success.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::MaxSpacesExceeded { .. })
    }
}

fn format_failures(failures: &[TeardownFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
