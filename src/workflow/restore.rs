//! Restore workflows driven by the `kbb` CLI: snapshot restores (clone +
//! rsync pod) and archive restores (worker pod with a FUSE mount), plus
//! the archive listing helper.
//!
//! Post-hooks re-attach workloads to the restored volume, so they run only
//! when the file sync succeeded; attaching to a half-restored volume is
//! worse than leaving the workload down.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, PostParams},
    Client,
};
use tokio::time::Duration;
use tracing::{info, warn};

use crate::clone;
use crate::config::{BackupEntry, Config};
use crate::hooks::{HookEngine, HookMode};
use crate::k8s::{snapshots, storage_class_binding_mode};
use crate::pod::{build_restore_pod, build_rsync_pod, fetch_logs, wait_pod_done};
use crate::runner::RunnerConfig;
use crate::tracker::ResourceTracker;
use crate::{APP_LABEL, MANAGED_BY};

/// Which in-cluster config secret to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppConfigKind {
    Snapshot,
    Borg,
}

impl AppConfigKind {
    fn suffix(self) -> &'static str {
        match self {
            AppConfigKind::Snapshot => "snapshot",
            AppConfigKind::Borg => "borg",
        }
    }
}

/// Config secret naming: `{release}-{app}-{kind}-config`.
pub fn app_config_secret_name(release: &str, app: &str, kind: AppConfigKind) -> String {
    format!("{}-{}-{}-config", release, app, kind.suffix())
}

/// Read and parse the `config.yaml` key of an app's config secret.
pub async fn load_app_config(
    client: &Client,
    namespace: &str,
    release: &str,
    app: &str,
    kind: AppConfigKind,
) -> Result<Config> {
    let secret_name = app_config_secret_name(release, app, kind);
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);

    let secret = match secrets.get(&secret_name).await {
        Ok(secret) => secret,
        Err(kube::Error::Api(ae)) if ae.code == 404 => bail!(
            "config secret not found: '{secret_name}' in namespace '{namespace}' \
             (expected from release '{release}' for app '{app}')"
        ),
        Err(e) => return Err(e).with_context(|| format!("failed to read secret {secret_name}")),
    };

    let data = secret
        .data
        .as_ref()
        .and_then(|d| d.get("config.yaml"))
        .ok_or_else(|| anyhow!("secret '{secret_name}' missing config.yaml data"))?;
    let yaml = String::from_utf8(data.0.clone())
        .with_context(|| format!("secret '{secret_name}' config.yaml is not UTF-8"))?;
    serde_yaml::from_str(&yaml)
        .with_context(|| format!("failed to parse config from secret {secret_name}"))
}

/// Infer the target PVC from the archive name: the archive must start
/// with exactly one configured entry's `{name}-` prefix. No match or more
/// than one match is fatal and lists the candidates.
pub fn infer_target_pvc(archive: &str, entries: &[BackupEntry]) -> Result<String> {
    let matches: Vec<&BackupEntry> = entries
        .iter()
        .filter(|e| archive.starts_with(&format!("{}-", e.name)))
        .collect();

    match matches.as_slice() {
        [entry] => Ok(entry.pvc.clone()),
        [] => {
            let candidates: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
            bail!(
                "archive '{archive}' matches no configured backup entry; candidates: {}",
                candidates.join(", ")
            )
        }
        multiple => {
            let names: Vec<&str> = multiple.iter().map(|e| e.name.as_str()).collect();
            bail!(
                "archive '{archive}' matches more than one backup entry ({}); \
                 pass --pvc to disambiguate",
                names.join(", ")
            )
        }
    }
}

pub struct RestoreWorkflow {
    client: Client,
    namespace: String,
    app: String,
    tracker: Arc<ResourceTracker>,
}

impl RestoreWorkflow {
    pub fn new(client: Client, namespace: &str, app: &str, tracker: Arc<ResourceTracker>) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            app: app.to_string(),
            tracker,
        }
    }

    /// Restore a VolumeSnapshot: clone it and rsync the clone into the
    /// target PVC.
    pub async fn restore_snapshot(
        &self,
        snapshot_config: &Config,
        borg_config: Option<&Config>,
        snapshot_id: &str,
        pvc_override: Option<&str>,
    ) -> Result<()> {
        let restore = &snapshot_config.restore;
        let engine = HookEngine::new(self.client.clone(), &self.namespace);

        // Pre-hooks are strict; a failure aborts before anything is
        // touched and post-hooks are not executed.
        if !restore.pre_hooks.is_empty() {
            info!("Executing pre-hooks...");
            engine.execute(&restore.pre_hooks, HookMode::Strict).await?;
            info!("Pre-hooks completed");
        }

        let snapshot = snapshots::get_snapshot(&self.client, &self.namespace, snapshot_id)
            .await
            .with_context(|| format!("VolumeSnapshot '{snapshot_id}' not found"))?;
        if !snapshots::is_ready(&snapshot) {
            bail!("VolumeSnapshot '{snapshot_id}' is not ready to use");
        }
        let source_pvc = snapshots::source_pvc(&snapshot)
            .ok_or_else(|| anyhow!("could not determine source PVC from snapshot '{snapshot_id}'"))?;
        info!(snapshot = %snapshot_id, source = %source_pvc, "Found snapshot");

        // Use the storage class the backup workflow would use for this
        // PVC so the clone lands on the same provisioner.
        let storage_class = borg_config.and_then(|config| {
            config
                .backups
                .iter()
                .find(|b| b.pvc == source_pvc)
                .and_then(|b| b.class.clone())
        });
        match &storage_class {
            Some(class) => {
                let mode = storage_class_binding_mode(&self.client, class)
                    .await
                    .unwrap_or_else(|_| "Unknown".to_string());
                info!(class = %class, binding_mode = %mode, "Using storage class from backup config");
            }
            None => warn!(
                "No storage class found in backup config, the clone will use the cluster default"
            ),
        }

        let target_pvc = pvc_override.unwrap_or(&source_pvc);
        info!(target = %target_pvc, "Target PVC");

        let clone_name = clone::clone_name(snapshot_id, Utc::now());
        info!(clone = %clone_name, "Creating clone PVC from snapshot");
        clone::create_clone(
            &self.client,
            &self.namespace,
            snapshot_id,
            &clone_name,
            storage_class.as_deref(),
        )
        .await?;
        self.tracker.track_clone(&clone_name).await;

        let sync_result = self
            .run_rsync_pod(snapshot_config, &clone_name, target_pvc)
            .await;

        match sync_result {
            Ok(()) => {
                self.run_post_hooks(&engine, &restore.post_hooks).await;
                self.tracker.delete_clone(&clone_name).await;
                info!(
                    "Restore complete: snapshot '{snapshot_id}' -> PVC '{target_pvc}'"
                );
                Ok(())
            }
            Err(e) => {
                // Sync failed: post-hooks are skipped.
                self.tracker.delete_clone(&clone_name).await;
                Err(e)
            }
        }
    }

    /// Restore an archive revision through a worker pod that mounts the
    /// revision and rsyncs it into the target PVC.
    pub async fn restore_archive(
        &self,
        config: &Config,
        archive_id: &str,
        pvc_override: Option<&str>,
    ) -> Result<()> {
        let restore = &config.restore;
        let engine = HookEngine::new(self.client.clone(), &self.namespace);

        if !restore.pre_hooks.is_empty() {
            info!("Executing pre-hooks...");
            engine.execute(&restore.pre_hooks, HookMode::Strict).await?;
            info!("Pre-hooks completed");
        }

        let target_pvc = match pvc_override {
            Some(pvc) => pvc.to_string(),
            None => infer_target_pvc(archive_id, &config.backups)?,
        };
        info!(target = %target_pvc, "Target PVC");

        let ts = Utc::now().format("%Y%m%d%H%M%S");
        let pod_name = format!("kbb-{}-restore-{}", self.app, ts);
        let secret_name = format!("{pod_name}-config");

        let payload = RunnerConfig {
            borg_repo: config.borg_repo.clone(),
            borg_passphrase: config.borg_passphrase.clone(),
            ssh_private_key: config.ssh_private_key.clone(),
            archive_name: Some(archive_id.to_string()),
            target_path: Some("/target".to_string()),
            ..Default::default()
        };
        self.create_config_secret(&secret_name, &payload).await?;
        self.tracker.track_secret(&secret_name).await;

        info!(pod = %pod_name, "Spawning borg restore pod");
        let pod = build_restore_pod(
            &pod_name,
            &self.namespace,
            &restore.pod,
            &secret_name,
            &config.cache_pvc,
            &target_pvc,
        );
        let result = self.run_pod_to_completion(&pod, &pod_name).await;

        match result {
            Ok(()) => {
                self.run_post_hooks(&engine, &restore.post_hooks).await;
                self.cleanup_pod_and_secret(&pod_name, &secret_name).await;
                info!("Restore complete: archive '{archive_id}' -> PVC '{target_pvc}'");
                Ok(())
            }
            Err(e) => {
                self.cleanup_pod_and_secret(&pod_name, &secret_name).await;
                Err(e)
            }
        }
    }

    /// Spawn the snapshot-restore rsync pod and wait for it, cleaning the
    /// pod up on every path.
    async fn run_rsync_pod(
        &self,
        config: &Config,
        source_pvc: &str,
        target_pvc: &str,
    ) -> Result<()> {
        let ts = Utc::now().format("%Y%m%d%H%M%S");
        let pod_name = format!("kbb-{}-rsync-{}", self.app, ts);
        let image = config.restore.pod.image.reference();

        info!(pod = %pod_name, "Spawning rsync pod");
        let pod = build_rsync_pod(&pod_name, &self.namespace, &image, source_pvc, target_pvc);
        let result = self.run_pod_to_completion(&pod, &pod_name).await;
        self.tracker.delete_pod(&pod_name).await;
        result
    }

    /// Create a pod, track it, and wait (unbounded, large restores can
    /// take hours) for a terminal phase with events and logs streamed.
    async fn run_pod_to_completion(&self, pod: &Pod, pod_name: &str) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        pods.create(&PostParams::default(), pod)
            .await
            .with_context(|| format!("failed to create pod {pod_name}"))?;
        self.tracker.track_pod(pod_name).await;

        let succeeded = wait_pod_done(&self.client, &self.namespace, pod_name, None).await?;
        if !succeeded {
            let logs = fetch_logs(&self.client, &self.namespace, pod_name)
                .await
                .unwrap_or_else(|_| "could not retrieve pod logs".to_string());
            bail!("restore pod {pod_name} failed:\n{logs}");
        }
        Ok(())
    }

    async fn run_post_hooks(&self, engine: &HookEngine, hooks: &[crate::hooks::Hook]) {
        if hooks.is_empty() {
            return;
        }
        info!("Executing post-hooks...");
        match engine.execute(hooks, HookMode::Lenient).await {
            Ok(report) if report.success => info!("Post-hooks completed"),
            Ok(report) => warn!("Some post-hooks failed: {}", report.failed.join("; ")),
            Err(e) => warn!("Post-hooks failed: {e}"),
        }
    }

    async fn cleanup_pod_and_secret(&self, pod_name: &str, secret_name: &str) {
        self.tracker.delete_pod(pod_name).await;
        self.tracker.delete_secret(secret_name).await;
    }

    async fn create_config_secret(&self, name: &str, payload: &RunnerConfig) -> Result<()> {
        let yaml = serde_yaml::to_string(payload).context("failed to serialize worker config")?;
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.to_string()),
                labels: Some(BTreeMap::from([
                    ("app".to_string(), APP_LABEL.to_string()),
                    ("managed-by".to_string(), MANAGED_BY.to_string()),
                    ("ephemeral".to_string(), "true".to_string()),
                ])),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            string_data: Some(BTreeMap::from([("config.yaml".to_string(), yaml)])),
            ..Default::default()
        };

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        secrets
            .create(&PostParams::default(), &secret)
            .await
            .with_context(|| format!("failed to create config secret {name}"))?;
        Ok(())
    }
}

/// The `kbb backup list` flow: run an ephemeral list pod, parse the JSON
/// block out of its mixed log output.
pub async fn list_archives(
    client: &Client,
    namespace: &str,
    app: &str,
    config: &Config,
    tracker: &ResourceTracker,
) -> Result<crate::runner::ArchiveListing> {
    let ts = Utc::now().format("%Y%m%d%H%M%S");
    let pod_name = format!("kbb-{app}-list-{ts}");
    let secret_name = format!("{pod_name}-config");

    let payload = RunnerConfig {
        borg_repo: config.borg_repo.clone(),
        borg_passphrase: config.borg_passphrase.clone(),
        ssh_private_key: config.ssh_private_key.clone(),
        ..Default::default()
    };

    let mut missing = Vec::new();
    if payload.borg_repo.is_none() {
        missing.push("borgRepo");
    }
    if payload.borg_passphrase.is_none() {
        missing.push("borgPassphrase");
    }
    if payload.ssh_private_key.is_none() {
        missing.push("sshPrivateKey");
    }
    if !missing.is_empty() {
        bail!("config missing required fields: {}", missing.join(", "));
    }

    let yaml = serde_yaml::to_string(&payload)?;
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                ("app".to_string(), APP_LABEL.to_string()),
                ("managed-by".to_string(), MANAGED_BY.to_string()),
                ("ephemeral".to_string(), "true".to_string()),
            ])),
            ..Default::default()
        },
        string_data: Some(BTreeMap::from([("config.yaml".to_string(), yaml)])),
        ..Default::default()
    };
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    secrets.create(&PostParams::default(), &secret).await?;
    tracker.track_secret(&secret_name).await;

    let pod = crate::pod::build_list_pod(&pod_name, namespace, &config.pod, &secret_name);
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let created = pods.create(&PostParams::default(), &pod).await;
    if let Err(e) = created {
        tracker.delete_secret(&secret_name).await;
        return Err(e).context("failed to create list pod");
    }
    tracker.track_pod(&pod_name).await;

    let outcome = crate::pod::wait_pod_done_quiet(
        client,
        namespace,
        &pod_name,
        Duration::from_secs(120),
    )
    .await;

    let result = match outcome {
        Ok(true) => {
            let logs = fetch_logs(client, namespace, &pod_name).await?;
            let json = extract_json_block(&logs)?;
            serde_json::from_str(&json).context("failed to parse archive listing JSON")
        }
        Ok(false) => {
            let logs = fetch_logs(client, namespace, &pod_name)
                .await
                .unwrap_or_else(|_| "could not retrieve pod logs".to_string());
            Err(anyhow!("list pod failed or timed out:\n{logs}"))
        }
        Err(e) => Err(e),
    };

    tracker.delete_pod(&pod_name).await;
    tracker.delete_secret(&secret_name).await;
    result
}

/// Pull the JSON document out of mixed pod log output. The list worker
/// writes pretty-printed JSON to stdout, so the document starts at the
/// first line that is exactly `{`.
pub fn extract_json_block(logs: &str) -> Result<String> {
    let lines: Vec<&str> = logs.lines().collect();
    let start = lines
        .iter()
        .position(|l| l.trim() == "{")
        .ok_or_else(|| anyhow!("no JSON output found in pod logs"))?;
    Ok(lines[start..].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(names: &[(&str, &str)]) -> Vec<BackupEntry> {
        names
            .iter()
            .map(|(name, pvc)| {
                serde_yaml::from_str(&format!("name: {name}\npvc: {pvc}\ntimeout: 60\n")).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_infer_target_pvc_single_match() {
        let backups = entries(&[("app-a", "a"), ("app-b", "b")]);
        let pvc = infer_target_pvc("app-a-2025-01-01-00-00-05", &backups).unwrap();
        assert_eq!(pvc, "a");
    }

    #[test]
    fn test_infer_target_pvc_no_match() {
        let backups = entries(&[("app-a", "a")]);
        let err = infer_target_pvc("unknown-2025", &backups).unwrap_err().to_string();
        assert!(err.contains("matches no configured backup entry"));
        assert!(err.contains("app-a"));
    }

    #[test]
    fn test_infer_target_pvc_ambiguous() {
        let backups = entries(&[("app", "a"), ("app-db", "b")]);
        let err = infer_target_pvc("app-db-2025-01-01-00-00-05", &backups)
            .unwrap_err()
            .to_string();
        assert!(err.contains("more than one"));
        assert!(err.contains("app"));
        assert!(err.contains("app-db"));
    }

    #[test]
    fn test_extract_json_block() {
        let logs = "[INFO] Listing archives\n[INFO] Found 2 archives\n{\n  \"repository\": \"repo\",\n  \"archive_count\": 0,\n  \"archives\": []\n}";
        let json = extract_json_block(logs).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["repository"], "repo");
    }

    #[test]
    fn test_extract_json_block_missing() {
        assert!(extract_json_block("no json here").is_err());
    }

    #[test]
    fn test_app_config_secret_name() {
        assert_eq!(
            app_config_secret_name("rel", "myapp", AppConfigKind::Borg),
            "rel-myapp-borg-config"
        );
        assert_eq!(
            app_config_secret_name("rel", "myapp", AppConfigKind::Snapshot),
            "rel-myapp-snapshot-config"
        );
    }
}
