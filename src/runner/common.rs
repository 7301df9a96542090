//! Shared worker plumbing: the per-run configuration carried in the
//! ephemeral secret, SSH key materialization, the borg environment, and
//! the repository bootstrap probe.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::info;

use crate::config::Retention;

/// Per-run worker configuration, serialized into the ephemeral config
/// secret by the controllers and read back inside the pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    #[serde(default)]
    pub borg_repo: Option<String>,
    #[serde(default)]
    pub borg_passphrase: Option<String>,
    #[serde(default)]
    pub ssh_private_key: Option<String>,

    /// Archive name prefix (the backup entry name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_wait: Option<u64>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cache_the_cache: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub borg_flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Retention::is_empty")]
    pub retention: Retention,

    // restore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
}

impl RunnerConfig {
    pub fn repo(&self) -> &str {
        self.borg_repo.as_deref().unwrap_or_default()
    }
}

/// Load the worker configuration and validate the base fields every
/// operation needs.
pub fn load_runner_config(path: &Path) -> Result<RunnerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("config file not found: {}", path.display()))?;
    let config: RunnerConfig =
        serde_yaml::from_str(&content).context("failed to parse config file")?;

    let mut missing = Vec::new();
    if config.borg_repo.as_deref().unwrap_or("").is_empty() {
        missing.push("borgRepo");
    }
    if config.borg_passphrase.as_deref().unwrap_or("").is_empty() {
        missing.push("borgPassphrase");
    }
    if config.ssh_private_key.as_deref().unwrap_or("").is_empty() {
        missing.push("sshPrivateKey");
    }
    if !missing.is_empty() {
        bail!("config missing required fields: {}", missing.join(", "));
    }

    Ok(config)
}

/// Validate the fields the backup operation needs on top of the base set.
pub fn validate_backup_fields(config: &RunnerConfig) -> Result<()> {
    let mut missing = Vec::new();
    if config.prefix.as_deref().unwrap_or("").is_empty() {
        missing.push("prefix");
    }
    if config.backup_dir.as_deref().unwrap_or("").is_empty() {
        missing.push("backupDir");
    }
    if config.lock_wait.is_none() {
        missing.push("lockWait");
    }
    if !missing.is_empty() {
        bail!(
            "config missing backup-specific fields: {}",
            missing.join(", ")
        );
    }
    Ok(())
}

/// Validate the fields the restore operation needs on top of the base set.
pub fn validate_restore_fields(config: &RunnerConfig) -> Result<()> {
    if config.archive_name.as_deref().unwrap_or("").is_empty() {
        bail!("config missing restore-specific fields: archiveName");
    }
    Ok(())
}

/// Write the SSH private key 0600 under the process home and return its
/// path.
pub fn setup_ssh_key(key_content: &str) -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory"))?;
    let ssh_dir = home.join(".ssh");
    let key_file = ssh_dir.join("borg-ssh.key");

    std::fs::create_dir_all(&ssh_dir)
        .with_context(|| format!("failed to create {}", ssh_dir.display()))?;
    std::fs::write(&key_file, key_content)
        .with_context(|| format!("failed to write {}", key_file.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&ssh_dir, std::fs::Permissions::from_mode(0o700))?;
        std::fs::set_permissions(&key_file, std::fs::Permissions::from_mode(0o600))?;
    }

    info!(path = %key_file.display(), "SSH key written");
    Ok(key_file)
}

/// Environment for every borg invocation. The SSH command pins the key
/// and disables host-key checking (worker pods have no known_hosts).
pub fn borg_env(
    config: &RunnerConfig,
    ssh_key_file: &Path,
    cache_dir: &str,
) -> Vec<(String, String)> {
    vec![
        ("BORG_REPO".to_string(), config.repo().to_string()),
        (
            "BORG_PASSPHRASE".to_string(),
            config.borg_passphrase.clone().unwrap_or_default(),
        ),
        (
            "BORG_RSH".to_string(),
            format!(
                "ssh -o IdentityFile={} -o IdentitiesOnly=yes -o StrictHostKeyChecking=no",
                ssh_key_file.display()
            ),
        ),
        ("BORG_CACHE_DIR".to_string(), cache_dir.to_string()),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoProbe {
    Ready,
    Initialized,
    Locked,
}

/// Probe the repository with `borg info` (60 s bound).
///
/// Exit 0 means ready. Exit 2 with "is not a valid repository" triggers
/// `borg init --encryption=repokey-blake2`; exit 2 with "Failed to
/// create/acquire the lock" means a writer holds the lock and the
/// subsequent command will wait on it itself. Anything else is fatal with
/// the full output.
pub async fn bootstrap_repository(repo: &str, env: &[(String, String)]) -> Result<RepoProbe> {
    info!("Checking repository status with 'borg info'...");
    let output = run_borg(&["info", repo], env, Duration::from_secs(60)).await?;

    if output.code == 0 {
        info!("Repository ready");
        return Ok(RepoProbe::Ready);
    }

    if output.code == 2 {
        if output.combined.contains("is not a valid repository") {
            info!("Repository not initialized, initializing...");
            let init = run_borg(
                &["init", "--encryption", "repokey-blake2", repo],
                env,
                Duration::from_secs(60),
            )
            .await?;
            if init.code != 0 {
                bail!("failed to initialize repository: {}", init.combined);
            }
            info!("Repository initialized");
            return Ok(RepoProbe::Initialized);
        }
        if output.combined.contains("Failed to create/acquire the lock") {
            info!("Repository locked, the next command will wait on the lock");
            return Ok(RepoProbe::Locked);
        }
        bail!("unexpected borg info failure (exit 2): {}", output.combined);
    }

    bail!(
        "borg info failed with exit code {}: {}",
        output.code,
        output.combined
    );
}

pub struct BorgOutput {
    pub code: i32,
    pub stdout: String,
    pub combined: String,
}

/// Run a borg command with captured output and a hard timeout.
pub async fn run_borg(
    args: &[&str],
    env: &[(String, String)],
    limit: Duration,
) -> Result<BorgOutput> {
    let mut cmd = Command::new("borg");
    cmd.args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in env {
        cmd.env(key, value);
    }

    let output = timeout(limit, cmd.output())
        .await
        .map_err(|_| anyhow!("borg {} timed out after {}s", args[0], limit.as_secs()))?
        .with_context(|| format!("failed to run borg {}", args[0]))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let mut combined = String::from_utf8_lossy(&output.stderr).to_string();
    combined.push_str(&stdout);

    Ok(BorgOutput {
        code: output.status.code().unwrap_or(-1),
        stdout,
        combined,
    })
}

/// Copy a directory with rsync, preserving attributes.
pub async fn rsync_dir(source: &str, target: &str, verbose: bool) -> Result<()> {
    let flags = if verbose { "-av" } else { "-a" };
    let status = Command::new("rsync")
        .args([flags, "--delete", &format!("{source}/"), &format!("{target}/")])
        .status()
        .await
        .context("failed to run rsync")?;
    if !status.success() {
        bail!("rsync {source} -> {target} exited with {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_config_roundtrip() {
        let config = RunnerConfig {
            borg_repo: Some("ssh://borg@host/./repo".to_string()),
            borg_passphrase: Some("pw".to_string()),
            ssh_private_key: Some("key".to_string()),
            prefix: Some("app-a".to_string()),
            backup_dir: Some("/data".to_string()),
            lock_wait: Some(600),
            cache_the_cache: true,
            borg_flags: vec!["--stats".to_string()],
            retention: serde_yaml::from_str("daily: 7").unwrap(),
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("borgRepo"));
        assert!(yaml.contains("lockWait: 600"));
        assert!(!yaml.contains("archiveName"));

        let parsed: RunnerConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.prefix.as_deref(), Some("app-a"));
        assert_eq!(parsed.retention.daily, Some(7));
        assert!(parsed.cache_the_cache);
    }

    #[test]
    fn test_validate_backup_fields_lists_missing() {
        let config = RunnerConfig {
            borg_repo: Some("r".to_string()),
            ..Default::default()
        };
        let err = validate_backup_fields(&config).unwrap_err().to_string();
        assert!(err.contains("prefix"));
        assert!(err.contains("backupDir"));
        assert!(err.contains("lockWait"));
    }

    #[test]
    fn test_borg_env_contents() {
        let config = RunnerConfig {
            borg_repo: Some("ssh://borg@host/./repo".to_string()),
            borg_passphrase: Some("pw".to_string()),
            ..Default::default()
        };
        let env = borg_env(&config, Path::new("/root/.ssh/borg-ssh.key"), "/cache");
        let get = |k: &str| {
            env.iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
                .unwrap()
        };
        assert_eq!(get("BORG_REPO"), "ssh://borg@host/./repo");
        assert_eq!(get("BORG_PASSPHRASE"), "pw");
        assert_eq!(get("BORG_CACHE_DIR"), "/cache");
        let rsh = get("BORG_RSH");
        assert!(rsh.contains("IdentityFile=/root/.ssh/borg-ssh.key"));
        assert!(rsh.contains("IdentitiesOnly=yes"));
        assert!(rsh.contains("StrictHostKeyChecking=no"));
    }
}
