use anyhow::{anyhow, bail, Result};
use futures::future::join_all;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::{
    api::{Api, Patch, PatchParams},
    Client,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::k8s::PodExecutor;

/// Hook kinds. `shell` is exec with `/bin/sh -c <script>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookKind {
    #[default]
    Exec,
    Scale,
    Shell,
}

/// One hook from the configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Hook {
    #[serde(rename = "type", default)]
    pub kind: HookKind,

    // exec / shell
    #[serde(default)]
    pub pod: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub script: Option<String>,

    // scale
    #[serde(default)]
    pub deployment: Option<String>,
    #[serde(default)]
    pub statefulset: Option<String>,
    #[serde(default)]
    pub replicas: Option<i32>,

    /// Consecutive hooks with `parallel=true` form one concurrent batch.
    #[serde(default)]
    pub parallel: bool,

    /// Pairs this hook with its counterpart in one long-running exec
    /// session; see the session module.
    #[serde(default, rename = "sessionId")]
    pub session_id: Option<String>,
}

impl Hook {
    /// Short identifier for log and error messages.
    pub fn describe(&self) -> String {
        match self.kind {
            HookKind::Exec => format!(
                "exec {} [{}]",
                self.pod.as_deref().unwrap_or("?"),
                self.command.join(" ")
            ),
            HookKind::Shell => format!("shell {}", self.pod.as_deref().unwrap_or("?")),
            HookKind::Scale => {
                let target = self
                    .deployment
                    .as_deref()
                    .map(|d| format!("deployment/{d}"))
                    .or_else(|| {
                        self.statefulset
                            .as_deref()
                            .map(|s| format!("statefulset/{s}"))
                    })
                    .unwrap_or_else(|| "?".to_string());
                format!("scale {} -> {:?}", target, self.replicas)
            }
        }
    }

    /// Shell rendering of the hook body, used by session-linked hooks.
    pub fn shell_body(&self) -> Result<String> {
        match self.kind {
            HookKind::Shell => self
                .script
                .clone()
                .ok_or_else(|| anyhow!("shell hook missing script: {}", self.describe())),
            HookKind::Exec => {
                if self.command.is_empty() {
                    bail!("exec hook missing command: {}", self.describe());
                }
                Ok(command_to_script(&self.command))
            }
            HookKind::Scale => bail!("scale hooks cannot be session-linked"),
        }
    }
}

/// Pre-hooks abort at first failure; post-hooks continue and accumulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookMode {
    Strict,
    Lenient,
}

#[derive(Debug)]
pub enum HookResult {
    Exec { stdout: String, stderr: String },
    Scale { replicas: i32 },
}

#[derive(Debug, Default)]
pub struct HookReport {
    pub success: bool,
    pub executed: usize,
    pub failed: Vec<String>,
    pub results: Vec<HookResult>,
}

/// Batches produced by the left-to-right grouping scan.
#[derive(Debug)]
pub enum Batch<'a> {
    Sequential(&'a Hook),
    Parallel(Vec<&'a Hook>),
}

/// Group consecutive `parallel=true` hooks into one batch; every other
/// hook is a batch of one. Batch order follows the listed order.
pub fn group_hooks(hooks: &[Hook]) -> Vec<Batch<'_>> {
    let mut batches = Vec::new();
    let mut current: Vec<&Hook> = Vec::new();

    for hook in hooks {
        if hook.parallel {
            current.push(hook);
        } else {
            if !current.is_empty() {
                batches.push(Batch::Parallel(std::mem::take(&mut current)));
            }
            batches.push(Batch::Sequential(hook));
        }
    }
    if !current.is_empty() {
        batches.push(Batch::Parallel(current));
    }

    batches
}

/// Single-quote a string for `/bin/sh`.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '='))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Render a command vector as a shell line.
pub fn command_to_script(command: &[String]) -> String {
    command
        .iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Executes ordered hook sequences against one namespace.
pub struct HookEngine {
    client: Client,
    executor: PodExecutor,
    namespace: String,
}

impl HookEngine {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            executor: PodExecutor::new(client.clone()),
            client,
            namespace: namespace.to_string(),
        }
    }

    /// Execute hooks in listed order. Strict mode returns an error at the
    /// first failing batch; lenient mode runs everything and reports.
    pub async fn execute(&self, hooks: &[Hook], mode: HookMode) -> Result<HookReport> {
        let mut report = HookReport {
            success: true,
            ..Default::default()
        };

        if hooks.is_empty() {
            return Ok(report);
        }

        info!(
            count = hooks.len(),
            mode = ?mode,
            "Running hooks"
        );

        for batch in group_hooks(hooks) {
            match batch {
                Batch::Sequential(hook) => {
                    self.run_one_into(hook, mode, &mut report).await?;
                }
                Batch::Parallel(batch_hooks) => {
                    let outcomes =
                        join_all(batch_hooks.iter().map(|h| self.execute_one(h))).await;
                    for (hook, outcome) in batch_hooks.iter().zip(outcomes) {
                        self.record(hook, outcome, mode, &mut report)?;
                    }
                }
            }
        }

        report.success = report.failed.is_empty();
        Ok(report)
    }

    async fn run_one_into(
        &self,
        hook: &Hook,
        mode: HookMode,
        report: &mut HookReport,
    ) -> Result<()> {
        let outcome = self.execute_one(hook).await;
        self.record(hook, outcome, mode, report)
    }

    fn record(
        &self,
        hook: &Hook,
        outcome: Result<HookResult>,
        mode: HookMode,
        report: &mut HookReport,
    ) -> Result<()> {
        match outcome {
            Ok(result) => {
                info!(hook = %hook.describe(), "Hook completed");
                report.executed += 1;
                report.results.push(result);
                Ok(())
            }
            Err(e) => {
                report.failed.push(e.to_string());
                match mode {
                    HookMode::Strict => {
                        Err(anyhow!("pre-hook failed, aborting: {}: {e}", hook.describe()))
                    }
                    HookMode::Lenient => {
                        warn!(hook = %hook.describe(), "Post-hook failed (continuing): {e}");
                        report.executed += 1;
                        Ok(())
                    }
                }
            }
        }
    }

    async fn execute_one(&self, hook: &Hook) -> Result<HookResult> {
        match hook.kind {
            HookKind::Exec => {
                let pod = hook
                    .pod
                    .as_deref()
                    .ok_or_else(|| anyhow!("exec hook missing pod"))?;
                if hook.command.is_empty() {
                    bail!("exec hook missing command (pod {pod})");
                }
                self.run_exec(pod, hook.container.as_deref(), hook.command.clone())
                    .await
            }
            HookKind::Shell => {
                let pod = hook
                    .pod
                    .as_deref()
                    .ok_or_else(|| anyhow!("shell hook missing pod"))?;
                let script = hook
                    .script
                    .as_deref()
                    .ok_or_else(|| anyhow!("shell hook missing script (pod {pod})"))?;
                let command = vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    script.to_string(),
                ];
                self.run_exec(pod, hook.container.as_deref(), command).await
            }
            HookKind::Scale => self.run_scale(hook).await,
        }
    }

    async fn run_exec(
        &self,
        pod: &str,
        container: Option<&str>,
        command: Vec<String>,
    ) -> Result<HookResult> {
        let rendered = command.join(" ");
        let output = self
            .executor
            .exec(&self.namespace, pod, container, command)
            .await?;
        if !output.success {
            bail!(
                "hook command failed in pod {pod} (namespace {}): {rendered}\nstdout: {}\nstderr: {}",
                self.namespace,
                output.stdout,
                output.stderr
            );
        }
        Ok(HookResult::Exec {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn run_scale(&self, hook: &Hook) -> Result<HookResult> {
        let replicas = hook
            .replicas
            .ok_or_else(|| anyhow!("scale hook missing replicas: {}", hook.describe()))?;
        let patch = json!({"spec": {"replicas": replicas}});
        let params = PatchParams::default();

        let current = match (&hook.deployment, &hook.statefulset) {
            (Some(name), None) => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
                let patched = api.patch(name, &params, &Patch::Strategic(&patch)).await?;
                patched.spec.and_then(|s| s.replicas).unwrap_or(replicas)
            }
            (None, Some(name)) => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.namespace);
                let patched = api.patch(name, &params, &Patch::Strategic(&patch)).await?;
                patched.spec.and_then(|s| s.replicas).unwrap_or(replicas)
            }
            _ => bail!(
                "scale hook must name exactly one of deployment or statefulset: {}",
                hook.describe()
            ),
        };

        Ok(HookResult::Scale { replicas: current })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(parallel: bool) -> Hook {
        serde_yaml::from_str(&format!(
            "type: exec\npod: p\ncommand: [echo, hi]\nparallel: {parallel}\n"
        ))
        .unwrap()
    }

    #[test]
    fn test_group_hooks_batches() {
        let hooks = vec![hook(false), hook(true), hook(true), hook(false)];
        let batches = group_hooks(&hooks);
        assert_eq!(batches.len(), 3);
        assert!(matches!(batches[0], Batch::Sequential(_)));
        match &batches[1] {
            Batch::Parallel(b) => assert_eq!(b.len(), 2),
            _ => panic!("expected parallel batch"),
        }
        assert!(matches!(batches[2], Batch::Sequential(_)));
    }

    #[test]
    fn test_group_hooks_trailing_parallel() {
        let hooks = vec![hook(true), hook(true)];
        let batches = group_hooks(&hooks);
        assert_eq!(batches.len(), 1);
        match &batches[0] {
            Batch::Parallel(b) => assert_eq!(b.len(), 2),
            _ => panic!("expected parallel batch"),
        }
    }

    #[test]
    fn test_hook_defaults_to_exec() {
        let h: Hook = serde_yaml::from_str("pod: p\ncommand: [ls]\n").unwrap();
        assert_eq!(h.kind, HookKind::Exec);
        assert!(!h.parallel);
        assert!(h.session_id.is_none());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain-arg"), "plain-arg");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_command_to_script() {
        let cmd = vec![
            "psql".to_string(),
            "-c".to_string(),
            "SELECT pg_backup_start()".to_string(),
        ];
        assert_eq!(
            command_to_script(&cmd),
            "psql -c 'SELECT pg_backup_start()'"
        );
    }

    #[test]
    fn test_shell_body_rejects_scale() {
        let h: Hook =
            serde_yaml::from_str("type: scale\ndeployment: d\nreplicas: 0\n").unwrap();
        assert!(h.shell_body().is_err());
    }
}
