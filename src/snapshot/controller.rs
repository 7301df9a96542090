//! Snapshot workflow: quiesce hooks, parallel snapshot creation, tiered
//! pruning.

use anyhow::{anyhow, Result};
use futures::future::join_all;
use kube::{Client, ResourceExt};
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::config::{Config, Retention, SnapshotEntry};
use crate::hooks::session::{collect_sessions, SessionSet};
use crate::hooks::{Hook, HookEngine, HookMode};
use crate::k8s::{snapshots, PodExecutor};

use super::retention::{preserved_names, SnapshotRecord};

/// Bound on the post-started probe after the signal files are written.
const POST_STARTED_TIMEOUT: Duration = Duration::from_secs(60);

pub struct SnapshotWorkflow {
    client: Client,
    namespace: String,
    engine: HookEngine,
    executor: PodExecutor,
    test_mode: bool,
}

impl SnapshotWorkflow {
    pub fn new(client: Client, namespace: &str, test_mode: bool) -> Self {
        Self {
            engine: HookEngine::new(client.clone(), namespace),
            executor: PodExecutor::new(client.clone()),
            client,
            namespace: namespace.to_string(),
            test_mode,
        }
    }

    /// Run the whole snapshot cycle. Returns the list of failures; plain
    /// post-hooks always run, even when snapshotting failed.
    pub async fn run(&self, config: &Config) -> Vec<String> {
        let entries = &config.snapshots.pvcs;
        let mut failures: Vec<String> = Vec::new();

        let pre: Vec<Hook> = entries
            .iter()
            .flat_map(|e| e.hooks.pre.iter().cloned())
            .collect();
        let post: Vec<Hook> = entries
            .iter()
            .flat_map(|e| e.hooks.post.iter().cloned())
            .collect();

        // Session-linked pairs leave the plain hook lists.
        let pairs = match collect_sessions(&pre, &post) {
            Ok(pairs) => pairs,
            Err(e) => return vec![format!("session hooks: {e}")],
        };
        let plain_pre: Vec<Hook> = pre.iter().filter(|h| h.session_id.is_none()).cloned().collect();
        let plain_post: Vec<Hook> = post.iter().filter(|h| h.session_id.is_none()).cloned().collect();

        let sessions = SessionSet::start(&self.executor, &self.namespace, pairs);

        let result = self
            .snapshot_cycle(config, entries, &plain_pre, &sessions, &mut failures)
            .await;
        if let Err(e) = result {
            error!("Snapshot cycle failed: {e}");
            failures.push(e.to_string());
        }

        // Sessions are released regardless of cycle outcome so the
        // post-bodies always get their chance to run.
        if !sessions.is_empty() {
            if let Err(e) = sessions.signal(&self.executor, &self.namespace).await {
                failures.push(format!("session signal: {e}"));
            } else if let Err(e) = sessions
                .wait_post_started(&self.executor, &self.namespace, POST_STARTED_TIMEOUT)
                .await
            {
                failures.push(e.to_string());
            }
            failures.extend(sessions.finish().await);
        }

        // Plain post-hooks are lenient and always run.
        match self.engine.execute(&plain_post, HookMode::Lenient).await {
            Ok(report) if !report.success => failures.extend(report.failed),
            Ok(_) => {}
            Err(e) => failures.push(format!("post-hooks: {e}")),
        }

        failures
    }

    async fn snapshot_cycle(
        &self,
        config: &Config,
        entries: &[SnapshotEntry],
        plain_pre: &[Hook],
        sessions: &SessionSet,
        failures: &mut Vec<String>,
    ) -> Result<()> {
        // Plain pre-hooks are strict: abort the cycle at the first failure.
        self.engine.execute(plain_pre, HookMode::Strict).await?;

        if !sessions.is_empty() {
            info!("Waiting for session-linked pre-hooks to checkpoint...");
            sessions
                .wait_pre_done(&self.executor, &self.namespace)
                .await?;
        }

        info!(count = entries.len(), "Creating snapshots in parallel");
        let ready_timeout = Duration::from_secs(config.snapshots.ready_timeout);
        let outcomes = join_all(
            entries
                .iter()
                .map(|entry| self.snapshot_one(entry, ready_timeout)),
        )
        .await;

        for (entry, outcome) in entries.iter().zip(outcomes) {
            match outcome {
                Ok(name) => info!(snapshot = %name, pvc = %entry.name, "Snapshot ready"),
                Err(e) => {
                    error!(pvc = %entry.name, "Snapshot failed: {e}");
                    failures.push(format!("{}: {e}", entry.name));
                }
            }
        }

        if !config.snapshots.retention.is_empty() && !self.test_mode {
            info!("Pruning old snapshots");
            for entry in entries {
                if let Err(e) = self
                    .prune_tiered(&entry.name, &config.snapshots.retention)
                    .await
                {
                    warn!(pvc = %entry.name, "Prune failed: {e}");
                    failures.push(format!("{}: prune: {e}", entry.name));
                }
            }
        }

        Ok(())
    }

    async fn snapshot_one(&self, entry: &SnapshotEntry, ready_timeout: Duration) -> Result<String> {
        if self.test_mode {
            info!(pvc = %entry.name, "TEST MODE: skipping snapshot creation");
            tokio::time::sleep(Duration::from_secs(2)).await;
            return Ok(format!("{}-snap-test", entry.name));
        }
        let class = entry
            .snapshot_class
            .as_deref()
            .ok_or_else(|| anyhow!("missing snapshotClass"))?;
        let name =
            snapshots::create_snapshot(&self.client, &self.namespace, &entry.name, class).await?;
        info!(snapshot = %name, "Waiting for snapshot to become ready...");
        snapshots::wait_snapshot_ready(&self.client, &self.namespace, &name, ready_timeout).await?;
        Ok(name)
    }

    /// Apply tiered retention to all snapshots of one source PVC.
    pub async fn prune_tiered(&self, pvc: &str, retention: &Retention) -> Result<()> {
        let items =
            snapshots::list_snapshots_for_pvc(&self.client, &self.namespace, pvc).await?;
        if items.is_empty() {
            return Ok(());
        }

        let records: Vec<SnapshotRecord> = items
            .iter()
            .filter_map(|s| {
                let created = crate::k8s::jiff_to_chrono(s.metadata.creation_timestamp.as_ref()?.0);
                Some(SnapshotRecord {
                    name: s.name_any(),
                    created,
                })
            })
            .collect();

        let keep = preserved_names(&records, retention, chrono::Utc::now());

        let mut deleted = 0usize;
        for record in &records {
            if keep.contains(&record.name) {
                continue;
            }
            match snapshots::delete_snapshot(&self.client, &self.namespace, &record.name).await {
                Ok(()) => {
                    info!(snapshot = %record.name, "Deleted old snapshot");
                    deleted += 1;
                }
                Err(e) => warn!(snapshot = %record.name, "Failed to delete snapshot: {e}"),
            }
        }

        if deleted > 0 {
            info!(pvc = %pvc, deleted, "Pruned old snapshots");
        }
        Ok(())
    }
}
