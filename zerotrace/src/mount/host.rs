use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::{MountController, MountPath, UnmountOutcome, IN_USE};
use crate::error::SpaceError;
use crate::storage::{SnapshotHandle, Zfs};
use crate::util::redact_reason;

/// Mounts ZFS clones at private directories under `mount_root`.
///
/// The root and every mount point are created `0700` so only the owning
/// user can traverse into a space.
#[derive(Debug, Clone)]
pub struct HostMountController {
    mount_root: PathBuf,
    zfs: Zfs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UmountFailure {
    Busy,
    NotMounted,
    Other,
}

impl HostMountController {
    pub fn new(mount_root: PathBuf, zfs: Zfs) -> Self {
        Self { mount_root, zfs }
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    /// Create the mount root if needed and restrict it to owner-only.
    pub async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.mount_root)
            .await
            .with_context(|| format!("creating mount root {}", self.mount_root.display()))?;
        tokio::fs::set_permissions(&self.mount_root, std::fs::Permissions::from_mode(0o700))
            .await
            .with_context(|| format!("restricting mount root {}", self.mount_root.display()))?;
        Ok(())
    }

    fn redact(&self, message: &str) -> String {
        redact_reason(message, &self.mount_root)
    }

    async fn remove_mount_point(&self, path: &MountPath) -> std::io::Result<()> {
        match tokio::fs::remove_dir(path.as_path()).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[async_trait]
impl MountController for HostMountController {
    #[instrument(skip(self))]
    async fn mount(&self, snapshot: &SnapshotHandle) -> Result<MountPath, SpaceError> {
        self.ensure_root()
            .await
            .map_err(|e| SpaceError::MountFailed(self.redact(&format!("{:#}", e))))?;

        let path = MountPath::for_snapshot(&self.mount_root, snapshot);
        if let Err(e) = tokio::fs::create_dir(path.as_path()).await {
            // An existing directory is not ours to remove
            return Err(SpaceError::MountFailed(if e.kind() == std::io::ErrorKind::AlreadyExists {
                format!("mount point for {} already exists", snapshot)
            } else {
                self.redact(&format!("creating mount point: {}", e))
            }));
        }

        let result = async {
            tokio::fs::set_permissions(path.as_path(), std::fs::Permissions::from_mode(0o700))
                .await
                .context("restricting mount point")?;
            let dataset = self.zfs.clone_dataset(snapshot);
            run_mount(&dataset, path.as_path()).await
        }
        .await;

        if let Err(e) = result {
            // Release the partially created mount point
            if let Err(e2) = self.remove_mount_point(&path).await {
                warn!(mount = %path.leaf(), error = %e2, "failed to remove mount point after mount failure");
            }
            return Err(SpaceError::MountFailed(self.redact(&format!("{:#}", e))));
        }

        info!(mount = %path.leaf(), "snapshot mounted");
        Ok(path)
    }

    #[instrument(skip_all, fields(mount = %path.leaf()))]
    async fn unmount(&self, path: &MountPath) -> Result<UnmountOutcome, SpaceError> {
        if !path.as_path().starts_with(&self.mount_root) {
            return Err(SpaceError::UnmountFailed(
                "refusing to unmount a path outside the mount root".into(),
            ));
        }

        match tokio::fs::symlink_metadata(path.as_path()).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(UnmountOutcome::AlreadyUnmounted);
            }
            Err(e) => return Err(SpaceError::UnmountFailed(self.redact(&e.to_string()))),
            Ok(_) => {}
        }

        debug!("running umount");
        let output = Command::new("umount")
            .arg(path.as_path())
            .output()
            .await
            .map_err(|e| SpaceError::UnmountFailed(format!("failed to execute umount: {}", e)))?;

        let outcome = if output.status.success() {
            UnmountOutcome::Unmounted
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            match classify_umount_error(&stderr) {
                UmountFailure::Busy => {
                    return Err(SpaceError::UnmountFailed(format!(
                        "mount point is {}",
                        IN_USE
                    )));
                }
                UmountFailure::NotMounted => UnmountOutcome::AlreadyUnmounted,
                UmountFailure::Other => {
                    return Err(SpaceError::UnmountFailed(self.redact(&stderr)));
                }
            }
        };

        self.remove_mount_point(path).await.map_err(|e| {
            SpaceError::UnmountFailed(self.redact(&format!("removing mount point: {}", e)))
        })?;

        info!(outcome = ?outcome, "mount point released");
        Ok(outcome)
    }

    async fn list_mounts(&self) -> Result<Vec<MountPath>, SpaceError> {
        let mut entries = match tokio::fs::read_dir(&self.mount_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SpaceError::MountListFailed(self.redact(&e.to_string()))),
        };

        let mut mounts = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "error reading mount root entry");
                    continue;
                }
            };
            let is_dir = match entry.file_type().await {
                Ok(ft) => ft.is_dir(),
                Err(_) => false,
            };
            if !is_dir {
                continue;
            }
            let name = entry.file_name();
            if let Some(handle) = SnapshotHandle::parse(&name.to_string_lossy()) {
                mounts.push(MountPath::for_snapshot(&self.mount_root, &handle));
            }
        }
        mounts.sort();
        Ok(mounts)
    }
}

/// Run: `mount -t zfs {dataset} {dir}`
async fn run_mount(dataset: &str, dir: &Path) -> Result<()> {
    debug!(dataset = %dataset, "running mount");

    let output = Command::new("mount")
        .args(["-t", "zfs", dataset])
        .arg(dir)
        .output()
        .await
        .context("failed to execute mount command")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("mount failed: {}", stderr.trim());
    }
    Ok(())
}

pub(crate) fn classify_umount_error(stderr: &str) -> UmountFailure {
    if stderr.contains("target is busy") || stderr.contains("device is busy") {
        UmountFailure::Busy
    } else if stderr.contains("not mounted") || stderr.contains("no mount point specified") {
        UmountFailure::NotMounted
    } else {
        UmountFailure::Other
    }
}
