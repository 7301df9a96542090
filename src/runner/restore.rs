//! The restore operation inside the worker pod: FUSE-mount an archive
//! revision, rsync it into the target volume, and always unmount.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{error, info, warn};

use crate::error::{EXIT_FAILURE, EXIT_OK, EXIT_SIGTERM};

use super::common::{
    bootstrap_repository, borg_env, load_runner_config, run_borg, setup_ssh_key,
    validate_restore_fields, RunnerConfig,
};

const MOUNT_POINT: &str = "/source";
const MOUNT_READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Wait for the FUSE process after `fusermount -u` before killing it.
const MOUNT_EXIT_WAIT: Duration = Duration::from_secs(10);

type SharedChild = Arc<Mutex<Option<Child>>>;

/// Some older archives wrap the volume in a single top-level `data/`
/// directory; restoring those verbatim would nest the payload one level
/// too deep. Returns the directory rsync should copy from.
pub fn resolve_rsync_source(mount_point: &Path) -> PathBuf {
    let entries: Vec<_> = match std::fs::read_dir(mount_point) {
        Ok(entries) => entries.flatten().collect(),
        Err(_) => return mount_point.to_path_buf(),
    };
    if entries.len() == 1 {
        let entry = &entries[0];
        if entry.file_name() == "data" && entry.path().is_dir() {
            return entry.path();
        }
    }
    mount_point.to_path_buf()
}

pub async fn run(config_path: &Path) -> i32 {
    let config = match load_runner_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return EXIT_FAILURE;
        }
    };
    if let Err(e) = validate_restore_fields(&config) {
        error!("{e}");
        return EXIT_FAILURE;
    }

    let mount_child: SharedChild = Arc::new(Mutex::new(None));
    let env = match prepare_env(&config) {
        Ok(env) => env,
        Err(e) => {
            error!("{e}");
            return EXIT_FAILURE;
        }
    };

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to install signal handler: {e}");
            return EXIT_FAILURE;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to install signal handler: {e}");
            return EXIT_FAILURE;
        }
    };

    let code = tokio::select! {
        result = run_restore(&config, &env, mount_child.clone()) => match result {
            Ok(()) => EXIT_OK,
            Err(e) => {
                error!("Restore failed: {e}");
                EXIT_FAILURE
            }
        },
        _ = sigterm.recv() => EXIT_SIGTERM,
        _ = sigint.recv() => EXIT_SIGTERM,
    };

    cleanup_mount(&mount_child, config.repo(), &env).await;
    if code == EXIT_SIGTERM {
        info!("Exiting due to termination signal");
    }
    code
}

fn prepare_env(config: &RunnerConfig) -> Result<Vec<(String, String)>> {
    let ssh_key = setup_ssh_key(config.ssh_private_key.as_deref().unwrap_or_default())?;
    Ok(borg_env(config, &ssh_key, "/root/.cache/borg"))
}

async fn run_restore(
    config: &RunnerConfig,
    env: &[(String, String)],
    mount_child: SharedChild,
) -> Result<()> {
    let repo = config.repo().to_string();
    let archive_name = config.archive_name.clone().unwrap_or_default();
    let target = config
        .target_path
        .clone()
        .unwrap_or_else(|| "/target".to_string());

    bootstrap_repository(&repo, env).await?;

    info!(archive = %archive_name, target = %target, "Starting restore");

    let mount_point = PathBuf::from(MOUNT_POINT);
    tokio::fs::create_dir_all(&mount_point).await?;

    // `borg mount -f` stays in the foreground for FUSE; it exits on
    // unmount or error.
    let archive_spec = format!("{repo}::{archive_name}");
    info!("Mounting archive via FUSE...");
    let mut cmd = Command::new("borg");
    cmd.args(["mount", "-f", &archive_spec, MOUNT_POINT]);
    for (key, value) in env {
        cmd.env(key, value);
    }
    let child = cmd.spawn().context("failed to spawn borg mount")?;
    info!(pid = child.id().unwrap_or_default(), "FUSE mount process started");
    *mount_child.lock().await = Some(child);

    if !wait_mount_ready(&mount_point, MOUNT_READY_TIMEOUT).await {
        bail!("mount not ready after {}s", MOUNT_READY_TIMEOUT.as_secs());
    }
    info!("Archive mounted");

    let source = resolve_rsync_source(&mount_point);
    if source != mount_point {
        info!("Legacy archive layout detected, restoring from data/");
    }

    let status = Command::new("rsync")
        .args([
            "-av",
            "--delete",
            &format!("{}/", source.display()),
            &format!("{target}/"),
        ])
        .status()
        .await
        .context("failed to run rsync")?;
    if !status.success() {
        bail!("rsync exited with {status}");
    }

    info!("Restore completed successfully");
    Ok(())
}

async fn wait_mount_ready(mount_point: &Path, limit: Duration) -> bool {
    info!("Waiting for mount to be ready (timeout: {}s)...", limit.as_secs());
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        let populated = std::fs::read_dir(mount_point)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if populated {
            return true;
        }
        sleep(Duration::from_millis(500)).await;
    }
    false
}

/// Unmount with `fusermount -u`, wait (bounded) for the mount process,
/// kill it if still running, and break the repository lock as a last
/// resort after a kill.
async fn cleanup_mount(mount_child: &SharedChild, repo: &str, env: &[(String, String)]) {
    let mut guard = mount_child.lock().await;
    let Some(mut child) = guard.take() else {
        return;
    };

    info!("Unmounting {MOUNT_POINT}...");
    match Command::new("fusermount")
        .args(["-u", MOUNT_POINT])
        .output()
        .await
    {
        Ok(output) if output.status.success() => info!("Unmount successful"),
        Ok(output) => warn!(
            "Unmount failed: {}",
            String::from_utf8_lossy(&output.stderr)
        ),
        Err(e) => warn!("Unmount error: {e}"),
    }

    match timeout(MOUNT_EXIT_WAIT, child.wait()).await {
        Ok(Ok(status)) => info!("FUSE mount process exited with {status}"),
        Ok(Err(e)) => warn!("Failed to wait for FUSE mount process: {e}"),
        Err(_) => {
            warn!("FUSE mount process did not exit, killing...");
            if let Err(e) = child.kill().await {
                warn!("Failed to kill FUSE mount process: {e}");
            }
            // Killed mid-operation: the repository lock may be stale.
            match run_borg(&["break-lock", repo], env, Duration::from_secs(10)).await {
                Ok(output) if output.code == 0 => info!("Lock cleanup complete"),
                Ok(output) => warn!("break-lock exited {}", output.code),
                Err(e) => warn!("Failed to break lock: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kbb-restore-test-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_legacy_layout_stripped() {
        let mount = temp_dir("legacy");
        std::fs::create_dir(mount.join("data")).unwrap();
        std::fs::write(mount.join("data").join("file.txt"), "x").unwrap();
        assert_eq!(resolve_rsync_source(&mount), mount.join("data"));
        std::fs::remove_dir_all(&mount).unwrap();
    }

    #[test]
    fn test_modern_layout_untouched() {
        let mount = temp_dir("modern");
        std::fs::create_dir(mount.join("data")).unwrap();
        std::fs::write(mount.join("other.txt"), "x").unwrap();
        assert_eq!(resolve_rsync_source(&mount), mount);
        std::fs::remove_dir_all(&mount).unwrap();
    }

    #[test]
    fn test_single_data_file_untouched() {
        // A single top-level *file* named data is not the legacy layout.
        let mount = temp_dir("file");
        std::fs::write(mount.join("data"), "x").unwrap();
        assert_eq!(resolve_rsync_source(&mount), mount);
        std::fs::remove_dir_all(&mount).unwrap();
    }

    #[test]
    fn test_missing_mount_point_untouched() {
        let missing = std::env::temp_dir().join("kbb-restore-test-missing-nonexistent");
        assert_eq!(resolve_rsync_source(&missing), missing);
    }
}
