pub mod host;
pub mod simulated;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SpaceError;
use crate::storage::SnapshotHandle;

pub use host::HostMountController;
pub use simulated::SimulatedMountController;

/// Reason text carried by [`SpaceError::UnmountFailed`] when another process
/// still holds the mount point.
pub(crate) const IN_USE: &str = "in use by another process";

/// Whether an unmount failed because the mount point is still in use.
pub fn is_in_use(err: &SpaceError) -> bool {
    matches!(err, SpaceError::UnmountFailed(reason) if reason.contains(IN_USE))
}

/// Absolute path at which a space's snapshot is mounted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MountPath(PathBuf);

impl MountPath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// The private mount point for `handle` under `root`.
    pub fn for_snapshot(root: &Path, handle: &SnapshotHandle) -> Self {
        Self(root.join(handle.as_str()))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Final path component, safe to log (it is the snapshot handle).
    pub fn leaf(&self) -> String {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl AsRef<Path> for MountPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// Result of an unmount that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountOutcome {
    Unmounted,
    AlreadyUnmounted,
}

/// Mounts snapshots at private paths.
#[async_trait]
pub trait MountController: Send + Sync + std::fmt::Debug {
    /// Mount `snapshot` at a fresh private path. On failure any partially
    /// created mount point is removed before [`SpaceError::MountFailed`] returns.
    async fn mount(&self, snapshot: &SnapshotHandle) -> Result<MountPath, SpaceError>;

    /// Unmount and remove the mount point. Already-unmounted is success;
    /// [`SpaceError::UnmountFailed`] means the path is still in use.
    async fn unmount(&self, path: &MountPath) -> Result<UnmountOutcome, SpaceError>;

    /// Mount points currently present under the private root.
    async fn list_mounts(&self) -> Result<Vec<MountPath>, SpaceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_path_for_snapshot() {
        let handle = SnapshotHandle::parse("zt-abc").unwrap();
        let path = MountPath::for_snapshot(Path::new("/run/zerotrace/spaces"), &handle);
        assert_eq!(path.as_path(), Path::new("/run/zerotrace/spaces/zt-abc"));
        assert_eq!(path.leaf(), "zt-abc");
    }

    #[test]
    fn in_use_is_detected_only_on_unmount_failures() {
        assert!(is_in_use(&SpaceError::UnmountFailed(format!(
            "mount point is {}",
            IN_USE
        ))));
        assert!(!is_in_use(&SpaceError::UnmountFailed("permission denied".into())));
        assert!(!is_in_use(&SpaceError::MountFailed(IN_USE.into())));
    }

    #[test]
    fn mount_path_serializes_as_plain_path() {
        let path = MountPath::new("/run/zerotrace/spaces/zt-abc");
        assert_eq!(
            serde_json::to_string(&path).unwrap(),
            "\"/run/zerotrace/spaces/zt-abc\""
        );
    }
}
