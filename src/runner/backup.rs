//! The backup operation inside the worker pod: drive `borg create`,
//! survive exit-2 bootstrap cases, prune by retention, and shut down
//! gracefully on SIGTERM.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{sleep, Duration, Instant};
use tracing::{error, info, warn};

use crate::config::Retention;
use crate::error::{EXIT_FAILURE, EXIT_OK, EXIT_SIGTERM};

use super::common::{
    bootstrap_repository, borg_env, load_runner_config, rsync_dir, run_borg, setup_ssh_key,
    validate_backup_fields, RunnerConfig,
};
use super::heartbeat::spawn_heartbeat;

/// Seconds to wait for borg's checkpoint after SIGINT before SIGKILL.
const CHECKPOINT_WAIT_SECS: u64 = 20;
const LOCAL_CACHE_DIR: &str = "/tmp/local-cache";
const PERSISTENT_CACHE_DIR: &str = "/cache";

/// Archive naming: `{prefix}-{YYYY-MM-DD-HH-MM-SS}` (UTC).
pub fn archive_name(prefix: &str, now: DateTime<Utc>) -> String {
    format!("{}-{}", prefix, now.format("%Y-%m-%d-%H-%M-%S"))
}

/// Arguments for `borg create`, minus the leading program name.
pub fn build_create_args(
    archive_spec: &str,
    backup_dir: &str,
    lock_wait: u64,
    borg_flags: &[String],
) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--lock-wait".to_string(),
        lock_wait.to_string(),
    ];
    args.extend(borg_flags.iter().cloned());
    args.push("--files-cache".to_string());
    args.push("mtime,size".to_string());
    args.push(archive_spec.to_string());
    args.push(backup_dir.to_string());
    args
}

/// Arguments for `borg prune` with the retention mapping, scoped to the
/// entry's archive prefix.
pub fn build_prune_args(repo: &str, prefix: &str, lock_wait: u64, retention: &Retention) -> Vec<String> {
    let mut args = vec![
        "prune".to_string(),
        "--lock-wait".to_string(),
        lock_wait.to_string(),
        "-v".to_string(),
        "--list".to_string(),
    ];
    let buckets = [
        ("--keep-hourly", retention.hourly),
        ("--keep-daily", retention.daily),
        ("--keep-weekly", retention.weekly),
        ("--keep-monthly", retention.monthly),
        ("--keep-yearly", retention.yearly),
    ];
    for (flag, value) in buckets {
        if let Some(keep) = value.filter(|n| *n > 0) {
            args.push(flag.to_string());
            args.push(keep.to_string());
        }
    }
    args.push("--glob-archives".to_string());
    args.push(format!("{prefix}-*"));
    args.push(repo.to_string());
    args
}

pub async fn run(config_path: &Path) -> i32 {
    let config = match load_runner_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return EXIT_FAILURE;
        }
    };
    if let Err(e) = validate_backup_fields(&config) {
        error!("{e}");
        return EXIT_FAILURE;
    }

    match run_backup(&config).await {
        Ok(code) => code,
        Err(e) => {
            error!("Backup failed: {e}");
            EXIT_FAILURE
        }
    }
}

async fn run_backup(config: &RunnerConfig) -> Result<i32> {
    let repo = config.repo().to_string();
    let prefix = config.prefix.clone().unwrap_or_default();
    let backup_dir = config.backup_dir.clone().unwrap_or_default();
    let lock_wait = config.lock_wait.unwrap_or(600);

    let ssh_key = setup_ssh_key(config.ssh_private_key.as_deref().unwrap_or_default())?;

    // Optionally stage the cache on pod-local storage; remote caches on
    // network volumes slow borg's chunk index churn considerably.
    let cache_dir = if config.cache_the_cache {
        info!("cache-the-cache enabled, staging {PERSISTENT_CACHE_DIR} to {LOCAL_CACHE_DIR}");
        tokio::fs::create_dir_all(LOCAL_CACHE_DIR).await?;
        rsync_dir(PERSISTENT_CACHE_DIR, LOCAL_CACHE_DIR, false).await?;
        LOCAL_CACHE_DIR
    } else {
        PERSISTENT_CACHE_DIR
    };
    let env = borg_env(config, &ssh_key, cache_dir);

    let name = archive_name(&prefix, Utc::now());
    let archive_spec = format!("{repo}::{name}");
    let create_args = build_create_args(&archive_spec, &backup_dir, lock_wait, &config.borg_flags);

    info!(archive = %name, dir = %backup_dir, "Starting backup");
    info!(lock_wait, "Lock wait timeout");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut child = spawn_borg(&create_args, &env)?;
        let pid = child.id().ok_or_else(|| anyhow!("borg exited before start"))?;
        info!(pid, "Borg started");
        let heartbeat = spawn_heartbeat(pid);

        let status = loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    heartbeat.abort();
                    graceful_stop(&mut child, &repo, &env).await;
                    write_back_cache(config).await;
                    return Ok(EXIT_SIGTERM);
                }
                _ = sigint.recv() => {
                    heartbeat.abort();
                    graceful_stop(&mut child, &repo, &env).await;
                    write_back_cache(config).await;
                    return Ok(EXIT_SIGTERM);
                }
                _ = sleep(Duration::from_millis(500)) => {
                    if let Some(status) = child.try_wait()? {
                        break status;
                    }
                }
            }
        };
        heartbeat.abort();

        match status.code() {
            Some(0) => break,
            Some(2) if attempt == 1 => {
                info!("Borg create exited 2, probing repository...");
                bootstrap_repository(&repo, &env).await?;
                info!("Retrying backup after repository check...");
            }
            Some(code) => {
                error!(code, "Borg exited non-zero");
                write_back_cache(config).await;
                return Ok(code);
            }
            None => {
                error!("Borg terminated by signal");
                write_back_cache(config).await;
                return Ok(EXIT_FAILURE);
            }
        }
    }

    info!(archive = %name, "Backup complete");

    if !config.retention.is_empty() {
        info!("Pruning old archives with retention policy...");
        let prune_args = build_prune_args(&repo, &prefix, lock_wait, &config.retention);
        let mut child = spawn_borg(&prune_args, &env)?;

        let deadline = Instant::now() + Duration::from_secs(lock_wait);
        let status = loop {
            if Instant::now() >= deadline {
                let _ = child.start_kill();
                write_back_cache(config).await;
                return Err(anyhow!("prune timed out after {lock_wait}s"));
            }
            tokio::select! {
                _ = sigterm.recv() => {
                    let _ = child.start_kill();
                    write_back_cache(config).await;
                    return Ok(EXIT_SIGTERM);
                }
                _ = sleep(Duration::from_millis(500)) => {
                    if let Some(status) = child.try_wait()? {
                        break status;
                    }
                }
            }
        };
        if !status.success() {
            error!("Prune failed with {status}");
            write_back_cache(config).await;
            return Ok(status.code().unwrap_or(EXIT_FAILURE));
        }
        info!("Prune complete");
    } else {
        info!("No retention policy specified, skipping prune");
    }

    if config.cache_the_cache {
        info!("Writing cache back to {PERSISTENT_CACHE_DIR}");
        rsync_dir(LOCAL_CACHE_DIR, PERSISTENT_CACHE_DIR, false).await?;
    }

    info!("Backup successful");
    Ok(EXIT_OK)
}

fn spawn_borg(args: &[String], env: &[(String, String)]) -> Result<Child> {
    let mut cmd = Command::new("borg");
    cmd.args(args);
    for (key, value) in env {
        cmd.env(key, value);
    }
    // stdout/stderr inherit: borg's own progress output is the pod log.
    cmd.spawn().context("failed to spawn borg")
}

/// SIGINT triggers borg's checkpoint-and-abort; give it time to finish,
/// then SIGKILL and break the stale repository lock we left behind.
async fn graceful_stop(child: &mut Child, repo: &str, env: &[(String, String)]) {
    info!("Received termination signal, stopping borg gracefully...");

    let Some(pid) = child.id() else {
        return;
    };
    info!(pid, "Sending SIGINT to borg (checkpoint + abort)...");
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        warn!("Failed to send SIGINT: {e}");
    }

    info!("Waiting up to {CHECKPOINT_WAIT_SECS}s for checkpoint to complete...");
    for elapsed in 1..=CHECKPOINT_WAIT_SECS {
        sleep(Duration::from_secs(1)).await;
        match child.try_wait() {
            Ok(Some(_)) => {
                info!("Borg stopped gracefully after {elapsed}s");
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Failed to poll borg: {e}");
                return;
            }
        }
    }

    info!("Checkpoint not complete after {CHECKPOINT_WAIT_SECS}s, forcing termination...");
    if let Err(e) = child.kill().await {
        warn!("Failed to kill borg: {e}");
    }

    // We killed the writer, so the lock is stale and must be broken.
    info!("Breaking stale lock...");
    match run_borg(&["break-lock", repo], env, Duration::from_secs(10)).await {
        Ok(output) if output.code == 0 => info!("Lock cleanup complete"),
        Ok(output) => warn!("break-lock exited {}: {}", output.code, output.combined),
        Err(e) => warn!("Failed to break lock: {e}"),
    }
}

/// Best-effort cache write-back on the shutdown path, verbose for
/// diagnostics.
async fn write_back_cache(config: &RunnerConfig) {
    if !config.cache_the_cache {
        return;
    }
    info!("Writing local cache back to {PERSISTENT_CACHE_DIR} (verbose)");
    if let Err(e) = rsync_dir(LOCAL_CACHE_DIR, PERSISTENT_CACHE_DIR, true).await {
        warn!("Cache write-back failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_name_format() {
        let now = DateTime::parse_from_rfc3339("2025-01-01T00:00:05Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(archive_name("app-a", now), "app-a-2025-01-01-00-00-05");
    }

    #[test]
    fn test_create_args() {
        let args = build_create_args(
            "repo::app-a-2025-01-01-00-00-05",
            "/data",
            600,
            &["--stats".to_string(), "--list".to_string()],
        );
        assert_eq!(
            args,
            vec![
                "create",
                "--lock-wait",
                "600",
                "--stats",
                "--list",
                "--files-cache",
                "mtime,size",
                "repo::app-a-2025-01-01-00-00-05",
                "/data",
            ]
        );
    }

    #[test]
    fn test_prune_args_scoped_to_prefix() {
        let retention: Retention =
            serde_yaml::from_str("hourly: 24\ndaily: 7\nyearly: 1").unwrap();
        let args = build_prune_args("repo", "app-a", 600, &retention);
        assert_eq!(
            args,
            vec![
                "prune",
                "--lock-wait",
                "600",
                "-v",
                "--list",
                "--keep-hourly",
                "24",
                "--keep-daily",
                "7",
                "--keep-yearly",
                "1",
                "--glob-archives",
                "app-a-*",
                "repo",
            ]
        );
    }

    #[test]
    fn test_prune_args_skip_zero_buckets() {
        let retention: Retention = serde_yaml::from_str("hourly: 0\ndaily: 7").unwrap();
        let args = build_prune_args("repo", "p", 60, &retention);
        assert!(!args.contains(&"--keep-hourly".to_string()));
        assert!(args.contains(&"--keep-daily".to_string()));
    }
}
