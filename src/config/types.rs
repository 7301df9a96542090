use k8s_openapi::api::core::v1::ResourceRequirements;
use serde::{Deserialize, Serialize};

use crate::hooks::Hook;

/// Root configuration structure.
///
/// A single YAML mapping shared by all workflows; each workflow validates
/// only the fields it consumes. Unknown top-level keys are ignored.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Tenant namespace all objects live in. Required by every workflow.
    #[serde(default)]
    pub namespace: Option<String>,

    /// Naming prefix for ephemeral objects. Required by the backup workflow.
    #[serde(default)]
    pub release_name: Option<String>,

    #[serde(default)]
    pub borg_repo: Option<String>,
    #[serde(default)]
    pub borg_passphrase: Option<String>,
    #[serde(default)]
    pub ssh_private_key: Option<String>,

    /// PVC holding the persistent borg cache, mounted read-write into each
    /// worker pod.
    #[serde(default = "default_cache_pvc", rename = "cachePVC")]
    pub cache_pvc: String,

    /// Copy the cache to pod-local storage for the duration of a backup.
    #[serde(default)]
    pub cache_the_cache: bool,

    #[serde(default)]
    pub backups: Vec<BackupEntry>,

    /// Archive-side retention applied by the worker after each backup.
    #[serde(default)]
    pub retention: Retention,

    #[serde(default)]
    pub snapshots: SnapshotsConfig,

    #[serde(default)]
    pub restore: RestoreConfig,

    #[serde(default)]
    pub pod: PodConfig,
}

fn default_cache_pvc() -> String {
    "borg-cache".to_string()
}

/// One backup entry: the contract between a source PVC and an archive
/// prefix.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    pub name: String,
    pub pvc: String,

    /// Storage class for the clone PVC. Required for snapshotted entries.
    #[serde(default)]
    pub class: Option<String>,

    /// Worker pod deadline in seconds (`activeDeadlineSeconds`).
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Bound on the clone readiness wait, seconds.
    #[serde(default = "default_clone_bind_timeout")]
    pub clone_bind_timeout: u64,

    /// When false the worker mounts the source PVC directly instead of a
    /// snapshot clone.
    #[serde(default = "default_true")]
    pub snapshotted: bool,

    #[serde(default = "default_borg_flags")]
    pub borg_flags: Vec<String>,
}

fn default_clone_bind_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_borg_flags() -> Vec<String> {
    vec!["--stats".to_string()]
}

/// Tiered retention buckets. Snapshot pruning uses hourly through monthly;
/// archive pruning additionally honours yearly.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Retention {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hourly: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekly: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yearly: Option<u32>,
}

impl Retention {
    pub fn is_empty(&self) -> bool {
        self.hourly.is_none()
            && self.daily.is_none()
            && self.weekly.is_none()
            && self.monthly.is_none()
            && self.yearly.is_none()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotsConfig {
    /// Bound on the per-snapshot readiness wait, seconds.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout: u64,

    #[serde(default)]
    pub retention: Retention,

    #[serde(default)]
    pub pvcs: Vec<SnapshotEntry>,
}

fn default_ready_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub name: String,
    #[serde(default)]
    pub snapshot_class: Option<String>,
    #[serde(default)]
    pub hooks: HookSet,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HookSet {
    #[serde(default)]
    pub pre: Vec<Hook>,
    #[serde(default)]
    pub post: Vec<Hook>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RestoreConfig {
    #[serde(default)]
    pub pre_hooks: Vec<Hook>,
    #[serde(default)]
    pub post_hooks: Vec<Hook>,
    #[serde(default)]
    pub pod: PodConfig,
}

/// Worker pod settings shared by backup and restore pods.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PodConfig {
    #[serde(default)]
    pub image: ImageConfig,

    /// Privileged is the default: the runner needs FUSE for archive mounts
    /// and unrestricted reads of cloned filesystems.
    #[serde(default = "default_true")]
    pub privileged: bool,

    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    #[serde(default = "default_image_repository")]
    pub repository: String,
    #[serde(default = "default_image_tag")]
    pub tag: String,
    #[serde(default = "default_pull_policy")]
    pub pull_policy: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            repository: default_image_repository(),
            tag: default_image_tag(),
            pull_policy: default_pull_policy(),
        }
    }
}

impl ImageConfig {
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

fn default_image_repository() -> String {
    "ghcr.io/frederikb96/kube-borg-backup/backup-runner".to_string()
}

fn default_image_tag() -> String {
    "latest".to_string()
}

fn default_pull_policy() -> String {
    "IfNotPresent".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_entry_defaults() {
        let entry: BackupEntry =
            serde_yaml::from_str("name: app-a\npvc: a\nclass: fast\ntimeout: 600\n").unwrap();
        assert!(entry.snapshotted);
        assert_eq!(entry.clone_bind_timeout, 300);
        assert_eq!(entry.borg_flags, vec!["--stats".to_string()]);
    }

    #[test]
    fn test_retention_is_empty() {
        assert!(Retention::default().is_empty());
        let r: Retention = serde_yaml::from_str("daily: 7").unwrap();
        assert!(!r.is_empty());
        assert_eq!(r.daily, Some(7));
        assert_eq!(r.yearly, None);
    }

    #[test]
    fn test_image_reference() {
        let img = ImageConfig::default();
        assert!(img.reference().ends_with(":latest"));
        assert_eq!(img.pull_policy, "IfNotPresent");
    }

    #[test]
    fn test_cache_pvc_key() {
        let cfg: Config = serde_yaml::from_str("namespace: ns\ncachePVC: my-cache\n").unwrap();
        assert_eq!(cfg.cache_pvc, "my-cache");
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let cfg: Config =
            serde_yaml::from_str("namespace: ns\nsomethingElse: 42\n").unwrap();
        assert_eq!(cfg.namespace.as_deref(), Some("ns"));
        assert_eq!(cfg.cache_pvc, "borg-cache");
    }
}
