use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::{SnapshotHandle, SnapshotProvider, HANDLE_PREFIX};
use crate::error::SpaceError;
use crate::space::SpaceId;

/// Low-level ZFS command wrapper. All operations shell out to the `zfs` CLI.
///
/// Layout under `pool_root` (e.g. "tank/zerotrace"):
/// - `{source_dataset}@zt-{id}`: the point-in-time snapshot of the protected volume
/// - `{pool_root}/spaces/zt-{id}`: writable copy-on-write clone, `mountpoint=legacy`
#[derive(Debug, Clone)]
pub struct Zfs {
    pool_root: String,
    source_dataset: String,
}

impl Zfs {
    pub fn new(pool_root: String, source_dataset: String) -> Self {
        Self {
            pool_root,
            source_dataset,
        }
    }

    /// Returns the pool root path (e.g. "tank/zerotrace").
    pub fn pool_root(&self) -> &str {
        &self.pool_root
    }

    /// The dataset whose state every space starts from.
    pub fn source_dataset(&self) -> &str {
        &self.source_dataset
    }

    /// Parent dataset of all space clones.
    pub fn spaces_parent(&self) -> String {
        format!("{}/spaces", self.pool_root)
    }

    /// Full snapshot name, e.g. "tank/zerotrace/base@zt-1f0c...".
    pub fn snapshot_name(&self, handle: &SnapshotHandle) -> String {
        format!("{}@{}", self.source_dataset, handle)
    }

    /// Full dataset path of the writable clone backing a space.
    pub fn clone_dataset(&self, handle: &SnapshotHandle) -> String {
        format!("{}/{}", self.spaces_parent(), handle)
    }

    /// Take a snapshot of the source dataset.
    ///
    /// Runs: `zfs snapshot {source}@{handle}`
    #[instrument(skip(self))]
    pub async fn snapshot(&self, handle: &SnapshotHandle) -> Result<String> {
        let full_snap = self.snapshot_name(handle);
        debug!(snapshot = %full_snap, "creating snapshot");

        run_zfs(&["snapshot", &full_snap])
            .await
            .with_context(|| format!("failed to create snapshot {}", full_snap))?;

        Ok(full_snap)
    }

    /// Clone a snapshot into a writable dataset that is only mounted explicitly.
    ///
    /// Runs: `zfs clone -o mountpoint=legacy -o compression=lz4 {source}@{handle} {pool}/spaces/{handle}`
    #[instrument(skip(self))]
    pub async fn clone_snapshot(&self, handle: &SnapshotHandle) -> Result<String> {
        let source = self.snapshot_name(handle);
        let target = self.clone_dataset(handle);

        debug!(source = %source, target = %target, "cloning snapshot");

        let args = build_clone_args(&source, &target);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_zfs(&args)
            .await
            .with_context(|| format!("failed to clone {} -> {}", source, target))?;

        Ok(target)
    }

    /// Destroy the clone backing a space, force-unmounting it if needed.
    ///
    /// Runs: `zfs destroy -r -f {pool}/spaces/{handle}`
    ///
    /// Returns `false` if the clone did not exist.
    #[instrument(skip(self))]
    pub async fn destroy_clone(&self, handle: &SnapshotHandle) -> Result<bool> {
        let dataset = self.clone_dataset(handle);
        self.check_clone_target(&dataset)?;

        debug!(dataset = %dataset, "destroying clone");
        run_zfs_allow_missing(&["destroy", "-r", "-f", &dataset])
            .await
            .with_context(|| format!("failed to destroy clone {}", dataset))
    }

    /// Destroy a managed snapshot of the source dataset.
    ///
    /// Runs: `zfs destroy {source}@{handle}`
    ///
    /// Returns `false` if the snapshot did not exist.
    #[instrument(skip(self))]
    pub async fn destroy_snapshot(&self, handle: &SnapshotHandle) -> Result<bool> {
        let full_snap = self.snapshot_name(handle);
        self.check_snapshot_target(&full_snap)?;

        debug!(snapshot = %full_snap, "destroying snapshot");
        run_zfs_allow_missing(&["destroy", &full_snap])
            .await
            .with_context(|| format!("failed to destroy snapshot {}", full_snap))
    }

    /// Safety: refuse to destroy anything outside `{pool}/spaces/zt-*`.
    fn check_clone_target(&self, dataset: &str) -> Result<()> {
        let prefix = format!("{}/{}", self.spaces_parent(), HANDLE_PREFIX);
        let Some(rest) = dataset.strip_prefix(&prefix) else {
            bail!(
                "refusing to destroy dataset '{}': not a managed clone under '{}'",
                dataset,
                self.spaces_parent()
            );
        };
        if rest.is_empty() || rest.contains('/') || rest.contains('@') {
            bail!("refusing to destroy dataset '{}': malformed clone name", dataset);
        }
        Ok(())
    }

    /// Safety: refuse to destroy snapshots that are not ours.
    fn check_snapshot_target(&self, full_snap: &str) -> Result<()> {
        let prefix = format!("{}@{}", self.source_dataset, HANDLE_PREFIX);
        match full_snap.strip_prefix(&prefix) {
            Some(rest) if !rest.is_empty() && !rest.contains('/') && !rest.contains('@') => Ok(()),
            _ => bail!(
                "refusing to destroy snapshot '{}': not a managed snapshot of '{}'",
                full_snap,
                self.source_dataset
            ),
        }
    }

    /// List managed snapshots of the source dataset.
    ///
    /// Runs: `zfs list -t snapshot -H -o name -d 1 {source}`
    #[instrument(skip(self))]
    pub async fn list_managed_snapshots(&self) -> Result<Vec<SnapshotHandle>> {
        let output = run_zfs_output(&[
            "list",
            "-t", "snapshot",
            "-H",
            "-o", "name",
            "-d", "1",
            &self.source_dataset,
        ])
        .await
        .with_context(|| format!("failed to list snapshots for {}", self.source_dataset))?;

        Ok(parse_managed_snapshots(&output, &self.source_dataset))
    }

    /// Check if a dataset exists.
    ///
    /// Runs: `zfs list -H -o name {dataset}`
    pub async fn dataset_exists(&self, dataset: &str) -> Result<bool> {
        let output = Command::new("zfs")
            .args(["list", "-H", "-o", "name", dataset])
            .output()
            .await
            .context("failed to run zfs list")?;

        Ok(output.status.success())
    }

    /// Get the available bytes on the pool root dataset.
    ///
    /// Runs: `zfs get -Hp -o value available {pool_root}`
    pub async fn pool_available_bytes(&self) -> Result<u64> {
        let output = run_zfs_output(&[
            "get", "-Hp", "-o", "value", "available", &self.pool_root,
        ])
        .await
        .with_context(|| format!("failed to get available space for {}", self.pool_root))?;

        output
            .trim()
            .parse()
            .with_context(|| format!("failed to parse available bytes: {:?}", output.trim()))
    }

    /// Ensure the parent dataset for clones exists. It is never mounted itself.
    ///
    /// Runs: `zfs create -p -o canmount=off -o mountpoint=none {pool}/spaces`
    pub async fn ensure_layout(&self) -> Result<()> {
        let parent = self.spaces_parent();
        if !self.dataset_exists(&parent).await? {
            debug!(dataset = %parent, "creating spaces parent dataset");
            run_zfs(&[
                "create", "-p", "-o", "canmount=off", "-o", "mountpoint=none", &parent,
            ])
            .await
            .with_context(|| format!("failed to create {}", parent))?;
        }
        Ok(())
    }
}

/// [`SnapshotProvider`] backed by ZFS snapshots and clones.
#[derive(Debug, Clone)]
pub struct ZfsSnapshotProvider {
    zfs: Zfs,
}

impl ZfsSnapshotProvider {
    /// Minimum available pool space (in bytes) below which creation fails.
    const MIN_POOL_BYTES: u64 = 1_073_741_824; // 1 GB

    pub fn new(zfs: Zfs) -> Self {
        Self { zfs }
    }

    pub fn zfs(&self) -> &Zfs {
        &self.zfs
    }

    async fn check_pool_space(&self) -> Result<()> {
        let available = self.zfs.pool_available_bytes().await?;
        if available < Self::MIN_POOL_BYTES {
            bail!(
                "insufficient pool space: {} MB available, {} MB required",
                available / (1024 * 1024),
                Self::MIN_POOL_BYTES / (1024 * 1024)
            );
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotProvider for ZfsSnapshotProvider {
    #[instrument(skip(self))]
    async fn create_snapshot(&self, space: SpaceId) -> Result<SnapshotHandle, SpaceError> {
        let handle = SnapshotHandle::for_space(space);

        self.check_pool_space()
            .await
            .map_err(|e| SpaceError::SnapshotCreationFailed(format!("{:#}", e)))?;

        self.zfs
            .snapshot(&handle)
            .await
            .map_err(|e| SpaceError::SnapshotCreationFailed(format!("{:#}", e)))?;

        if let Err(e) = self.zfs.clone_snapshot(&handle).await {
            // Rollback the snapshot so a failed creation leaves nothing behind
            if let Err(e2) = self.zfs.destroy_snapshot(&handle).await {
                warn!(snapshot = %handle, error = %e2, "failed to rollback snapshot after clone failure");
            }
            return Err(SpaceError::SnapshotCreationFailed(format!("{:#}", e)));
        }

        info!(snapshot = %handle, "snapshot and clone created");
        Ok(handle)
    }

    #[instrument(skip(self))]
    async fn delete_snapshot(&self, handle: &SnapshotHandle) -> Result<(), SpaceError> {
        // The clone depends on the snapshot, so it goes first
        let clone_existed = self
            .zfs
            .destroy_clone(handle)
            .await
            .map_err(|e| SpaceError::SnapshotDeletionFailed(format!("{:#}", e)))?;
        let snap_existed = self
            .zfs
            .destroy_snapshot(handle)
            .await
            .map_err(|e| SpaceError::SnapshotDeletionFailed(format!("{:#}", e)))?;

        if clone_existed || snap_existed {
            info!(snapshot = %handle, "snapshot destroyed");
        } else {
            debug!(snapshot = %handle, "snapshot already gone");
        }
        Ok(())
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotHandle>, SpaceError> {
        self.zfs
            .list_managed_snapshots()
            .await
            .map_err(|e| SpaceError::SnapshotListFailed(format!("{:#}", e)))
    }
}

/// Run a `zfs` command and check for success.
async fn run_zfs(args: &[&str]) -> Result<()> {
    debug!(args = ?args, "running zfs command");

    let output = Command::new("zfs")
        .args(args)
        .output()
        .await
        .context("failed to execute zfs command")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("zfs {} failed: {}", args.first().unwrap_or(&""), stderr.trim());
    }

    Ok(())
}

/// Run a `zfs` command where a missing target counts as done.
///
/// Returns `true` if the command acted on something, `false` if the target
/// was already gone.
async fn run_zfs_allow_missing(args: &[&str]) -> Result<bool> {
    debug!(args = ?args, "running zfs command");

    let output = Command::new("zfs")
        .args(args)
        .output()
        .await
        .context("failed to execute zfs command")?;

    if output.status.success() {
        return Ok(true);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if is_missing_dataset_error(&stderr) {
        return Ok(false);
    }
    bail!("zfs {} failed: {}", args.first().unwrap_or(&""), stderr.trim());
}

/// Run a `zfs` command and return its stdout.
async fn run_zfs_output(args: &[&str]) -> Result<String> {
    debug!(args = ?args, "running zfs command");

    let output = Command::new("zfs")
        .args(args)
        .output()
        .await
        .context("failed to execute zfs command")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("zfs {} failed: {}", args.first().unwrap_or(&""), stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

pub(crate) fn build_clone_args(source: &str, target: &str) -> Vec<String> {
    vec![
        "clone".into(),
        "-o".into(),
        "mountpoint=legacy".into(),
        "-o".into(),
        "compression=lz4".into(),
        source.into(),
        target.into(),
    ]
}

/// Whether zfs stderr says the dataset or snapshot is simply not there.
pub(crate) fn is_missing_dataset_error(stderr: &str) -> bool {
    stderr.contains("does not exist") || stderr.contains("could not find any snapshots")
}

/// Parse `zfs list -H -o name` output for managed snapshots of `source`.
pub(crate) fn parse_managed_snapshots(output: &str, source: &str) -> Vec<SnapshotHandle> {
    let mut handles = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((dataset, snap)) = line.split_once('@') else {
            warn!(line = %line, "skipping malformed snapshot line");
            continue;
        };
        if dataset != source {
            continue;
        }
        if let Some(handle) = SnapshotHandle::parse(snap) {
            handles.push(handle);
        }
    }
    handles
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zfs() -> Zfs {
        Zfs::new("tank/zerotrace".into(), "tank/zerotrace/base".into())
    }

    #[test]
    fn test_zfs_pool_root() {
        let zfs = zfs();
        assert_eq!(zfs.pool_root(), "tank/zerotrace");
        assert_eq!(zfs.source_dataset(), "tank/zerotrace/base");
        assert_eq!(zfs.spaces_parent(), "tank/zerotrace/spaces");
    }

    #[test]
    fn test_snapshot_and_clone_names() {
        let zfs = zfs();
        let handle = SnapshotHandle::parse("zt-abc123").unwrap();
        assert_eq!(zfs.snapshot_name(&handle), "tank/zerotrace/base@zt-abc123");
        assert_eq!(zfs.clone_dataset(&handle), "tank/zerotrace/spaces/zt-abc123");
    }

    #[test]
    fn test_build_clone_args_is_legacy_mounted() {
        let args = build_clone_args("tank/zerotrace/base@zt-a", "tank/zerotrace/spaces/zt-a");
        assert_eq!(args[0], "clone");
        assert!(args.windows(2).any(|w| w[0] == "-o" && w[1] == "mountpoint=legacy"));
        assert!(args.windows(2).any(|w| w[0] == "-o" && w[1] == "compression=lz4"));
        assert_eq!(args[args.len() - 2], "tank/zerotrace/base@zt-a");
        assert_eq!(args[args.len() - 1], "tank/zerotrace/spaces/zt-a");
    }

    #[test]
    fn test_destroy_guard_rejects_foreign_datasets() {
        let zfs = zfs();
        assert!(zfs.check_clone_target("tank/zerotrace").is_err());
        assert!(zfs.check_clone_target("tank/zerotrace/spaces").is_err());
        assert!(zfs.check_clone_target("tank/zerotrace/spaces/").is_err());
        assert!(zfs.check_clone_target("tank/zerotrace/spaces/zt-").is_err());
        assert!(zfs.check_clone_target("tank/zerotrace/spaces/other").is_err());
        assert!(zfs.check_clone_target("tank/zerotrace/spaces/zt-a/child").is_err());
        assert!(zfs.check_clone_target("tank/zerotrace/base").is_err());
        assert!(zfs.check_clone_target("tank/zerotrace/spaces/zt-abc").is_ok());
    }

    #[test]
    fn test_destroy_guard_rejects_foreign_snapshots() {
        let zfs = zfs();
        assert!(zfs.check_snapshot_target("tank/zerotrace/base@daily").is_err());
        assert!(zfs.check_snapshot_target("tank/zerotrace/base@zt-").is_err());
        assert!(zfs.check_snapshot_target("tank/other@zt-abc").is_err());
        assert!(zfs.check_snapshot_target("tank/zerotrace/base@zt-abc").is_ok());
    }

    #[test]
    fn test_parse_managed_snapshots() {
        let output = "tank/zerotrace/base@zt-aaa\n\
                      tank/zerotrace/base@daily-2024\n\
                      tank/zerotrace/base@zt-bbb\n\
                      tank/zerotrace/base/child@zt-ccc\n\
                      \n\
                      garbage-line\n";
        let handles = parse_managed_snapshots(output, "tank/zerotrace/base");
        let names: Vec<&str> = handles.iter().map(|h| h.as_str()).collect();
        assert_eq!(names, vec!["zt-aaa", "zt-bbb"]);
    }

    #[test]
    fn test_parse_managed_snapshots_empty() {
        assert!(parse_managed_snapshots("", "tank/zerotrace/base").is_empty());
    }

    #[test]
    fn test_missing_dataset_detection() {
        assert!(is_missing_dataset_error(
            "cannot open 'tank/zerotrace/spaces/zt-a': dataset does not exist"
        ));
        assert!(is_missing_dataset_error(
            "could not find any snapshots to destroy; check snapshot names."
        ));
        assert!(!is_missing_dataset_error("cannot destroy 'tank/x': dataset is busy"));
        assert!(!is_missing_dataset_error("permission denied"));
    }
}
