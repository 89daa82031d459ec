//! CLI subcommand implementations: `check`, `sweep` and `status`.
//!
//! None of these keep state between runs. `sweep` is meant to run once at
//! boot (or after a crash) before any space is created.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use zerotrace::config::Config;
use zerotrace::events::TracingSink;
use zerotrace::mount::{HostMountController, MountController};

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

struct Check {
    label: &'static str,
    ok: bool,
    detail: String,
    fix: Option<String>,
}

impl Check {
    fn pass(label: &'static str, detail: impl Into<String>) -> Self {
        Self { label, ok: true, detail: detail.into(), fix: None }
    }

    fn fail(label: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self { label, ok: false, detail: detail.into(), fix: Some(fix.into()) }
    }
}

/// Run `zerotrace check`. Returns `Ok(())` if all checks pass, `Err` otherwise.
pub fn run_check(config: &Config) -> Result<()> {
    println!("Checking prerequisites...\n");

    let mut checks: Vec<Check> = Vec::new();

    checks.push(Check::pass(
        "Config",
        format!(
            "max_spaces={}, budgets {}/{}/{} ms",
            config.space.max_spaces,
            config.space.creation_budget_ms,
            config.space.mount_budget_ms,
            config.space.teardown_budget_ms
        ),
    ));

    if config.space.test_mode {
        checks.push(Check::pass("Backend", "simulated (test_mode = true)"));
    } else {
        checks.push(check_root());
        checks.push(check_zfs());
        checks.push(check_binary("mount"));
        checks.push(check_binary("umount"));
        checks.push(check_dataset("ZFS pool", &config.storage.pool_root()));
        checks.push(check_dataset("Source dataset", &config.storage.source_dataset_path()));
        checks.push(check_mount_root(&config.storage.mount_root));
    }

    let all_pass = checks.iter().all(|c| c.ok);

    for c in &checks {
        let icon = if c.ok { "\u{2713}" } else { "\u{2717}" };
        println!("  {} {} ({})", icon, c.label, c.detail);
        if !c.ok {
            if let Some(fix) = &c.fix {
                println!("    Fix: {}", fix);
            }
        }
    }

    println!();
    if all_pass {
        println!("All checks passed. Run: zerotrace sweep --config config.toml");
        Ok(())
    } else {
        let failed = checks.iter().filter(|c| !c.ok).count();
        anyhow::bail!("{} check(s) failed", failed)
    }
}

fn check_root() -> Check {
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        Check::pass("Privileges", "running as root")
    } else {
        Check::fail(
            "Privileges",
            format!("running as uid {}", euid),
            "zfs clone and mount(8) need root: run with sudo",
        )
    }
}

fn check_zfs() -> Check {
    match std::process::Command::new("zfs").arg("version").output() {
        Ok(out) if out.status.success() => {
            let version = String::from_utf8_lossy(&out.stdout);
            let version = version
                .lines()
                .next()
                .unwrap_or("unknown")
                .trim()
                .to_string();
            Check::pass("ZFS", version)
        }
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            Check::fail(
                "ZFS",
                format!("zfs exited with error: {}", stderr.trim()),
                "Install ZFS: apt install zfsutils-linux",
            )
        }
        Err(e) => Check::fail(
            "ZFS",
            format!("zfs not found: {}", e),
            "Install ZFS: apt install zfsutils-linux",
        ),
    }
}

fn check_binary(name: &'static str) -> Check {
    match std::process::Command::new(name).arg("--version").output() {
        Ok(out) if out.status.success() => {
            let version = String::from_utf8_lossy(&out.stdout);
            Check::pass(name, version.lines().next().unwrap_or(name).trim().to_string())
        }
        Ok(_) => Check::pass(name, "present"),
        Err(e) => Check::fail(
            name,
            format!("{} not found: {}", name, e),
            "Install util-linux: apt install util-linux",
        ),
    }
}

fn check_dataset(label: &'static str, dataset: &str) -> Check {
    match std::process::Command::new("zfs")
        .arg("list")
        .arg(dataset)
        .output()
    {
        Ok(out) if out.status.success() => Check::pass(label, dataset),
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            Check::fail(
                label,
                format!("{} not found: {}", dataset, stderr.trim()),
                format!("Create it: zfs create -p {}", dataset),
            )
        }
        Err(e) => Check::fail(
            label,
            format!("zfs list {} failed: {}", dataset, e),
            format!("Create it: zfs create -p {}", dataset),
        ),
    }
}

fn check_mount_root(root: &Path) -> Check {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::metadata(root) {
        Ok(meta) if !meta.is_dir() => Check::fail(
            "Mount root",
            format!("{} is not a directory", root.display()),
            "Point storage.mount_root at a directory",
        ),
        Ok(meta) => {
            let mode = meta.permissions().mode() & 0o777;
            if mode == 0o700 {
                Check::pass("Mount root", root.display().to_string())
            } else {
                Check::fail(
                    "Mount root",
                    format!("{} has mode {:o}", root.display(), mode),
                    format!("chmod 700 {}", root.display()),
                )
            }
        }
        // Created with mode 0700 on first mount
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Check::pass(
            "Mount root",
            format!("{} (created on first use)", root.display()),
        ),
        Err(e) => Check::fail(
            "Mount root",
            format!("{}: {}", root.display(), e),
            "Check permissions on storage.mount_root",
        ),
    }
}

// ---------------------------------------------------------------------------
// sweep
// ---------------------------------------------------------------------------

/// Run `zerotrace sweep`. Fails if any orphan could not be reclaimed.
pub async fn run_sweep(config: &Config, dry_run: bool, print_metrics: bool) -> Result<()> {
    if !config.space.test_mode && !dry_run {
        config
            .storage
            .zfs()
            .ensure_layout()
            .await
            .context("preparing ZFS layout")?;
    }

    let orchestrator = config.orchestrator(Arc::new(TracingSink));
    let report = if dry_run {
        orchestrator.find_orphans().await?
    } else {
        orchestrator.recovery_sweep().await?
    };

    let verb = if dry_run { "Would reclaim" } else { "Reclaimed" };
    println!(
        "{} {} mount point{} and {} snapshot{}",
        verb,
        report.orphan_mounts.len(),
        if report.orphan_mounts.len() == 1 { "" } else { "s" },
        report.orphan_snapshots.len(),
        if report.orphan_snapshots.len() == 1 { "" } else { "s" },
    );
    for mount in &report.orphan_mounts {
        println!("  mount     {}", mount.leaf());
    }
    for snapshot in &report.orphan_snapshots {
        println!("  snapshot  {}", snapshot);
    }
    for failure in &report.failures {
        println!("  failed    {}", failure);
    }

    if print_metrics {
        println!();
        print!("{}", orchestrator.metrics().encode_metrics());
    }

    if !report.is_clean() {
        anyhow::bail!("{} orphan(s) could not be reclaimed", report.failures.len());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

/// Run `zerotrace status`: what the host currently holds, whether or not any
/// process is tracking it.
pub async fn run_status(config: &Config, json: bool) -> Result<()> {
    if config.space.test_mode {
        println!("test_mode is enabled: the simulated backend keeps no host state");
        return Ok(());
    }

    let zfs = config.storage.zfs();
    let snapshots = zfs
        .list_managed_snapshots()
        .await
        .context("listing managed snapshots")?;
    let mounts = HostMountController::new(config.storage.mount_root.clone(), zfs)
        .list_mounts()
        .await?;

    if json {
        let body = serde_json::json!({
            "snapshots": snapshots,
            "mounts": mounts.iter().map(|m| m.leaf()).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!("Snapshots: {}", snapshots.len());
    for snapshot in &snapshots {
        let owner = snapshot
            .space_id()
            .map(|id| id.short())
            .unwrap_or_else(|| "-".to_string());
        println!("  {:<40}  space {}", snapshot, owner);
    }
    println!("Mount points: {}", mounts.len());
    for mount in &mounts {
        println!("  {}", mount.leaf());
    }
    Ok(())
}

/// Load a config from an optional path, falling back to defaults.
pub fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Ok(Config::default()),
    }
}
