//! The backup workflow: clone fan-out, then sequential archive writes.
//!
//! Phase 1 submits every clone request in parallel and does not wait for
//! readiness. Phase 2 walks the entries in configuration order and blocks
//! on each entry's own clone just before its worker pod launches, so the
//! first backup starts as soon as the first clone is ready while the rest
//! keep provisioning in the background. Archive writes stay sequential:
//! the repository accepts a single writer.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures::future::join_all;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, PostParams},
    Client,
};
use tokio::time::Duration;
use tracing::{error, info};

use crate::clone;
use crate::config::{BackupEntry, Config};
use crate::error::FatalError;
use crate::k8s::{snapshots, validate_storage_class};
use crate::pod::{backup_pod_name, build_backup_pod, config_secret_name, wait_pod_done};
use crate::runner::RunnerConfig;
use crate::tracker::ResourceTracker;
use crate::{APP_LABEL, MANAGED_BY};

struct CloneRequest {
    entry: BackupEntry,
    clone_name: String,
    failure: Option<String>,
}

pub struct BackupWorkflow {
    client: Client,
    namespace: String,
    release_name: String,
    tracker: Arc<ResourceTracker>,
    test_mode: bool,
}

impl BackupWorkflow {
    pub fn new(
        client: Client,
        config: &Config,
        tracker: Arc<ResourceTracker>,
        test_mode: bool,
    ) -> Result<Self, FatalError> {
        let namespace = config
            .namespace
            .clone()
            .ok_or_else(|| FatalError::Config("missing required fields: namespace".into()))?;
        let release_name = config
            .release_name
            .clone()
            .ok_or_else(|| FatalError::Config("missing required fields: releaseName".into()))?;
        Ok(Self {
            client,
            namespace,
            release_name,
            tracker,
            test_mode,
        })
    }

    /// Run both phases over every configured entry. Returns the failure
    /// summary; an empty summary is a clean run.
    pub async fn run(&self, config: &Config) -> Vec<String> {
        let mut failures: Vec<String> = Vec::new();

        let (snapshotted, direct): (Vec<_>, Vec<_>) = config
            .backups
            .iter()
            .cloned()
            .partition(|e| e.snapshotted);

        for entry in &direct {
            info!(entry = %entry.name, "Direct mode, will back up the original PVC");
        }

        info!(
            count = snapshotted.len(),
            "Phase 1: creating clone PVCs in parallel"
        );
        let requests = join_all(snapshotted.iter().map(|e| self.request_clone(e.clone()))).await;
        for request in &requests {
            if let Some(reason) = &request.failure {
                error!(entry = %request.entry.name, "Clone creation failed: {reason}");
                failures.push(format!("{}: {}", request.entry.name, reason));
            }
        }
        info!("All clone PVC creation requests submitted");

        info!("Phase 2: processing backups sequentially");
        for request in requests {
            if request.failure.is_some() {
                info!(entry = %request.entry.name, "Skipping, clone creation failed in Phase 1");
                continue;
            }
            if let Err(e) = self.process_snapshotted(config, &request).await {
                error!(entry = %request.entry.name, "Backup failed: {e}");
                failures.push(format!("{}: {e}", request.entry.name));
            }
        }

        for entry in direct {
            if let Err(e) = self.process_direct(config, &entry).await {
                error!(entry = %entry.name, "Direct backup failed: {e}");
                failures.push(format!("{}: {e}", entry.name));
            }
        }

        failures
    }

    /// Phase 1 for one entry: resolve the newest ready snapshot, validate
    /// the storage class, submit the clone request. Never blocks on clone
    /// readiness.
    async fn request_clone(&self, entry: BackupEntry) -> CloneRequest {
        let fail = |entry: BackupEntry, reason: String| CloneRequest {
            entry,
            clone_name: String::new(),
            failure: Some(reason),
        };

        let Some(class) = entry.class.clone() else {
            return fail(entry, "Config error - missing required fields".to_string());
        };

        info!(entry = %entry.name, pvc = %entry.pvc, "Finding latest snapshot");
        let snapshot = match snapshots::latest_ready_snapshot(
            &self.client,
            &self.namespace,
            &entry.pvc,
        )
        .await
        {
            Ok(Some(name)) => name,
            Ok(None) => return fail(entry, "No snapshot found".to_string()),
            Err(e) => return fail(entry, e.to_string()),
        };
        info!(entry = %entry.name, snapshot = %snapshot, "Found snapshot");

        if let Err(e) = validate_storage_class(&self.client, &class).await {
            return fail(entry, e.to_string());
        }

        let clone_name = clone::clone_name(&snapshot, Utc::now());
        info!(entry = %entry.name, clone = %clone_name, "Creating clone PVC");
        if let Err(e) = clone::create_clone(
            &self.client,
            &self.namespace,
            &snapshot,
            &clone_name,
            Some(&class),
        )
        .await
        {
            return fail(entry, e.to_string());
        }
        self.tracker.track_clone(&clone_name).await;

        CloneRequest {
            entry,
            clone_name,
            failure: None,
        }
    }

    /// Phase 2 for a snapshotted entry: block on this clone's readiness,
    /// run the worker pod, clean up unconditionally.
    async fn process_snapshotted(&self, config: &Config, request: &CloneRequest) -> Result<()> {
        let entry = &request.entry;
        info!(entry = %entry.name, "Processing backup");

        let bind_timeout = Duration::from_secs(entry.clone_bind_timeout);
        info!(
            entry = %entry.name,
            clone = %request.clone_name,
            timeout = entry.clone_bind_timeout,
            "Waiting for clone PVC to be ready"
        );
        let ready =
            clone::wait_clone_ready(&self.client, &self.namespace, &request.clone_name, bind_timeout)
                .await;
        if let Err(e) = ready {
            self.tracker.delete_clone(&request.clone_name).await;
            return Err(anyhow!("Clone PVC bind failed: {e}"));
        }

        let result = self
            .run_worker(config, entry, &request.clone_name)
            .await;
        self.tracker.delete_clone(&request.clone_name).await;
        result
    }

    /// Phase 2 for a direct entry: no clone, the worker mounts the source
    /// PVC read-only.
    async fn process_direct(&self, config: &Config, entry: &BackupEntry) -> Result<()> {
        info!(entry = %entry.name, pvc = %entry.pvc, "Processing direct backup");
        self.run_worker(config, entry, &entry.pvc).await
    }

    /// Launch one worker pod against a data PVC and wait for its terminal
    /// phase. The ephemeral secret and the pod are deleted on every path.
    async fn run_worker(&self, config: &Config, entry: &BackupEntry, data_pvc: &str) -> Result<()> {
        let timeout = entry
            .timeout
            .ok_or_else(|| anyhow!("Config error - missing timeout"))?;

        if self.test_mode {
            info!(entry = %entry.name, "TEST MODE: skipping worker pod spawn");
            tokio::time::sleep(Duration::from_secs(2)).await;
            info!("TEST MODE: backup simulation successful");
            return Ok(());
        }

        let pod_name = backup_pod_name(&self.release_name, &entry.name, Utc::now());
        let secret_name = config_secret_name(&pod_name);

        let result = self
            .launch_and_wait(config, entry, data_pvc, &pod_name, &secret_name, timeout)
            .await;

        self.tracker.delete_secret(&secret_name).await;
        self.tracker.delete_pod(&pod_name).await;
        result
    }

    async fn launch_and_wait(
        &self,
        config: &Config,
        entry: &BackupEntry,
        data_pvc: &str,
        pod_name: &str,
        secret_name: &str,
        timeout: u64,
    ) -> Result<()> {
        info!(secret = %secret_name, "Creating ephemeral config secret");
        let payload = RunnerConfig {
            borg_repo: config.borg_repo.clone(),
            borg_passphrase: config.borg_passphrase.clone(),
            ssh_private_key: config.ssh_private_key.clone(),
            prefix: Some(entry.name.clone()),
            backup_dir: Some("/data".to_string()),
            lock_wait: Some(timeout),
            cache_the_cache: config.cache_the_cache,
            borg_flags: entry.borg_flags.clone(),
            retention: config.retention.clone(),
            ..Default::default()
        };
        self.create_config_secret(secret_name, &payload).await?;
        self.tracker.track_secret(secret_name).await;

        info!(pod = %pod_name, "Spawning worker pod");
        let pod = build_backup_pod(
            pod_name,
            &self.namespace,
            &entry.name,
            &config.pod,
            secret_name,
            data_pvc,
            &config.cache_pvc,
            timeout,
        );
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        pods.create(&PostParams::default(), &pod)
            .await
            .with_context(|| format!("failed to create worker pod {pod_name}"))?;
        self.tracker.track_pod(pod_name).await;

        info!(pod = %pod_name, timeout, "Waiting for worker pod to complete");
        let succeeded = wait_pod_done(
            &self.client,
            &self.namespace,
            pod_name,
            Some(Duration::from_secs(timeout)),
        )
        .await?;

        if !succeeded {
            return Err(anyhow!("Borg pod failed"));
        }
        info!(entry = %entry.name, "Backup completed");
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, snapshotted: bool) -> BackupEntry {
        serde_yaml::from_str(&format!(
            "name: {name}\npvc: {name}-pvc\nclass: fast\ntimeout: 600\nsnapshotted: {snapshotted}\n"
        ))
        .unwrap()
    }

    #[test]
    fn test_snapshotted_entries_processed_before_direct() {
        let entries = vec![entry("direct-1", false), entry("snap-1", true), entry("snap-2", true)];
        let (snapshotted, direct): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|e| e.snapshotted);
        assert_eq!(
            snapshotted.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            vec!["snap-1", "snap-2"]
        );
        assert_eq!(
            direct.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            vec!["direct-1"]
        );
    }

    #[test]
    fn test_worker_secret_payload() {
        let config: Config = serde_yaml::from_str(
            "namespace: ns\nreleaseName: rel\nborgRepo: repo\nborgPassphrase: pw\nsshPrivateKey: key\nretention:\n  daily: 7\n",
        )
        .unwrap();
        let e = entry("app-a", true);
        let payload = RunnerConfig {
            borg_repo: config.borg_repo.clone(),
            borg_passphrase: config.borg_passphrase.clone(),
            ssh_private_key: config.ssh_private_key.clone(),
            prefix: Some(e.name.clone()),
            backup_dir: Some("/data".to_string()),
            lock_wait: e.timeout,
            cache_the_cache: config.cache_the_cache,
            borg_flags: e.borg_flags.clone(),
            retention: config.retention.clone(),
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&payload).unwrap();
        assert!(yaml.contains("prefix: app-a"));
        assert!(yaml.contains("backupDir: /data"));
        assert!(yaml.contains("lockWait: 600"));
        assert!(yaml.contains("daily: 7"));
        assert!(!yaml.contains("archiveName"));
    }
}
