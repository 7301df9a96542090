//! Session-linked pre/post hooks.
//!
//! A pre/post pair sharing a `sessionId` runs inside one long-running exec
//! session in the target container, so a single shell invocation (for
//! example a database `START BACKUP` / `STOP BACKUP` bracket) survives the
//! whole snapshot window. Coordination happens through checkpoint files
//! under /tmp in the target container:
//!
//! - `kbb-pre-done-{id}`: the pre-body finished, the session is waiting
//! - `kbb-signal-{id}`: written by the orchestrator, the post-body may run
//! - `kbb-post-started-{id}`: the post-body began (liveness proof)
//! - `kbb-post-done-{id}`: the session is complete

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, bail, Result};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{info, warn};

use crate::k8s::{ExecOutput, PodExecutor};

use super::executor::Hook;

pub fn pre_done_file(id: &str) -> String {
    format!("/tmp/kbb-pre-done-{id}")
}

pub fn signal_file(id: &str) -> String {
    format!("/tmp/kbb-signal-{id}")
}

pub fn post_started_file(id: &str) -> String {
    format!("/tmp/kbb-post-started-{id}")
}

pub fn post_done_file(id: &str) -> String {
    format!("/tmp/kbb-post-done-{id}")
}

/// One validated pre/post pair targeting a single container.
#[derive(Debug, Clone)]
pub struct SessionPair {
    pub id: String,
    pub pod: String,
    pub container: Option<String>,
    pub pre_body: String,
    pub post_body: String,
}

/// Pair up session-linked hooks from a pre and a post sequence. Each id
/// must appear exactly once on each side, target the same pod, and be a
/// shell-able hook kind.
pub fn collect_sessions(pre: &[Hook], post: &[Hook]) -> Result<Vec<SessionPair>> {
    let mut post_by_id: HashMap<&str, &Hook> = HashMap::new();
    for hook in post.iter().filter(|h| h.session_id.is_some()) {
        let id = hook.session_id.as_deref().unwrap();
        if post_by_id.insert(id, hook).is_some() {
            bail!("duplicate post-hook sessionId: {id}");
        }
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut pairs = Vec::new();
    for hook in pre.iter().filter(|h| h.session_id.is_some()) {
        let id = hook.session_id.as_deref().unwrap();
        if !seen.insert(id) {
            bail!("duplicate pre-hook sessionId: {id}");
        }
        let post_hook = post_by_id
            .remove(id)
            .ok_or_else(|| anyhow!("pre-hook sessionId {id} has no matching post-hook"))?;

        let pod = hook
            .pod
            .clone()
            .ok_or_else(|| anyhow!("session {id}: pre-hook missing pod"))?;
        if post_hook.pod.as_deref() != Some(pod.as_str()) {
            bail!("session {id}: pre and post hooks must target the same pod");
        }

        pairs.push(SessionPair {
            id: id.to_string(),
            pod,
            container: hook.container.clone(),
            pre_body: hook.shell_body()?,
            post_body: post_hook.shell_body()?,
        });
    }

    if let Some(id) = post_by_id.keys().next() {
        bail!("post-hook sessionId {id} has no matching pre-hook");
    }

    Ok(pairs)
}

/// Render the inner script executed inside the target container.
pub fn session_script(pair: &SessionPair) -> String {
    let pre_done = pre_done_file(&pair.id);
    let signal = signal_file(&pair.id);
    let post_started = post_started_file(&pair.id);
    let post_done = post_done_file(&pair.id);
    format!(
        "{pre}\n\
         touch {pre_done}\n\
         while [ ! -e {signal} ]; do sleep 1; done\n\
         touch {post_started}\n\
         {post}\n\
         touch {post_done}\n\
         rm -f {pre_done} {signal} {post_started} {post_done}\n",
        pre = pair.pre_body,
        post = pair.post_body,
    )
}

/// A set of running session execs plus their checkpoints.
pub struct SessionSet {
    pairs: Vec<SessionPair>,
    handles: Vec<JoinHandle<Result<ExecOutput>>>,
}

impl SessionSet {
    /// Start every session in the background; each task holds an open exec
    /// stream until the inner script completes.
    pub fn start(executor: &PodExecutor, namespace: &str, pairs: Vec<SessionPair>) -> Self {
        let mut handles = Vec::with_capacity(pairs.len());
        for pair in &pairs {
            let script = session_script(pair);
            let executor = executor.clone();
            let namespace = namespace.to_string();
            let pod = pair.pod.clone();
            let container = pair.container.clone();
            let id = pair.id.clone();
            handles.push(tokio::spawn(async move {
                info!(session = %id, pod = %pod, "Starting session-linked hook");
                executor
                    .exec_sh(&namespace, &pod, container.as_deref(), &script)
                    .await
            }));
        }
        Self { pairs, handles }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Block until every session has written its pre-done checkpoint.
    ///
    /// Unbounded: the outer activity deadline on the pod (or the CronJob)
    /// is the bound. An exec failure while probing means the session
    /// container died and is an error.
    pub async fn wait_pre_done(&self, executor: &PodExecutor, namespace: &str) -> Result<()> {
        let mut waiting: Vec<&SessionPair> = self.pairs.iter().collect();
        while !waiting.is_empty() {
            let mut still_waiting = Vec::new();
            for pair in waiting {
                let done = executor
                    .file_exists(
                        namespace,
                        &pair.pod,
                        pair.container.as_deref(),
                        &pre_done_file(&pair.id),
                    )
                    .await?;
                if done {
                    info!(session = %pair.id, "Pre-hook finished, session waiting");
                } else {
                    still_waiting.push(pair);
                }
            }
            waiting = still_waiting;
            if !waiting.is_empty() {
                sleep(Duration::from_secs(2)).await;
            }
        }
        Ok(())
    }

    /// Write every signal checkpoint, allowing the post-bodies to run.
    pub async fn signal(&self, executor: &PodExecutor, namespace: &str) -> Result<()> {
        for pair in &self.pairs {
            executor
                .exec_sh_checked(
                    namespace,
                    &pair.pod,
                    pair.container.as_deref(),
                    &format!("touch {}", signal_file(&pair.id)),
                )
                .await?;
        }
        Ok(())
    }

    /// Wait (bounded) for every session to prove its post-body started.
    /// Absence within the bound means the session died between pre-done
    /// and signal.
    pub async fn wait_post_started(
        &self,
        executor: &PodExecutor,
        namespace: &str,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut waiting: Vec<&SessionPair> = self.pairs.iter().collect();
        while !waiting.is_empty() {
            if Instant::now() >= deadline {
                let ids: Vec<&str> = waiting.iter().map(|p| p.id.as_str()).collect();
                bail!(
                    "session(s) did not reach post-hook within {}s: {}",
                    timeout.as_secs(),
                    ids.join(", ")
                );
            }
            let mut still_waiting = Vec::new();
            for pair in waiting {
                let started = executor
                    .file_exists(
                        namespace,
                        &pair.pod,
                        pair.container.as_deref(),
                        &post_started_file(&pair.id),
                    )
                    .await
                    .unwrap_or(false);
                if !started {
                    still_waiting.push(pair);
                }
            }
            waiting = still_waiting;
            if !waiting.is_empty() {
                sleep(Duration::from_secs(1)).await;
            }
        }
        Ok(())
    }

    /// Await every session exec stream; returns error strings for sessions
    /// whose inner script failed.
    pub async fn finish(self) -> Vec<String> {
        let mut errors = Vec::new();
        for (pair, handle) in self.pairs.iter().zip(self.handles) {
            match handle.await {
                Ok(Ok(output)) if output.success => {}
                Ok(Ok(output)) => {
                    let msg = format!(
                        "session {} exited non-zero\nstdout: {}\nstderr: {}",
                        pair.id, output.stdout, output.stderr
                    );
                    warn!("{msg}");
                    errors.push(msg);
                }
                Ok(Err(e)) => {
                    let msg = format!("session {} exec failed: {e}", pair.id);
                    warn!("{msg}");
                    errors.push(msg);
                }
                Err(e) => {
                    let msg = format!("session {} task panicked: {e}", pair.id);
                    warn!("{msg}");
                    errors.push(msg);
                }
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_hook(session: &str, pod: &str, cmd: &str) -> Hook {
        serde_yaml::from_str(&format!(
            "type: exec\npod: {pod}\ncommand: [{cmd}]\nsessionId: {session}\n"
        ))
        .unwrap()
    }

    fn shell_hook(session: &str, pod: &str, script: &str) -> Hook {
        serde_yaml::from_str(&format!(
            "type: shell\npod: {pod}\nscript: \"{script}\"\nsessionId: {session}\n"
        ))
        .unwrap()
    }

    #[test]
    fn test_collect_sessions_pairs() {
        let pre = vec![shell_hook("db", "postgres-0", "start-backup")];
        let post = vec![shell_hook("db", "postgres-0", "stop-backup")];
        let pairs = collect_sessions(&pre, &post).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].id, "db");
        assert_eq!(pairs[0].pre_body, "start-backup");
        assert_eq!(pairs[0].post_body, "stop-backup");
    }

    #[test]
    fn test_collect_sessions_unpaired() {
        let pre = vec![shell_hook("db", "p", "a")];
        let err = collect_sessions(&pre, &[]).unwrap_err().to_string();
        assert!(err.contains("no matching post-hook"));

        let post = vec![shell_hook("orphan", "p", "b")];
        let err = collect_sessions(&[], &post).unwrap_err().to_string();
        assert!(err.contains("no matching pre-hook"));
    }

    #[test]
    fn test_collect_sessions_pod_mismatch() {
        let pre = vec![shell_hook("db", "pod-a", "a")];
        let post = vec![shell_hook("db", "pod-b", "b")];
        let err = collect_sessions(&pre, &post).unwrap_err().to_string();
        assert!(err.contains("same pod"));
    }

    #[test]
    fn test_collect_sessions_exec_bodies_quoted() {
        let pre = vec![exec_hook("db", "p", "echo, hi there")];
        let post = vec![exec_hook("db", "p", "echo, done")];
        let pairs = collect_sessions(&pre, &post).unwrap();
        assert_eq!(pairs[0].pre_body, "echo 'hi there'");
    }

    #[test]
    fn test_session_script_checkpoint_order() {
        let pair = SessionPair {
            id: "db".to_string(),
            pod: "p".to_string(),
            container: None,
            pre_body: "pre-cmd".to_string(),
            post_body: "post-cmd".to_string(),
        };
        let script = session_script(&pair);

        let pre_done = script.find("touch /tmp/kbb-pre-done-db").unwrap();
        let wait = script.find("while [ ! -e /tmp/kbb-signal-db ]").unwrap();
        let post_started = script.find("touch /tmp/kbb-post-started-db").unwrap();
        let post_done = script.find("touch /tmp/kbb-post-done-db").unwrap();
        let pre_body = script.find("pre-cmd").unwrap();
        let post_body = script.find("post-cmd").unwrap();

        assert!(pre_body < pre_done);
        assert!(pre_done < wait);
        assert!(wait < post_started);
        assert!(post_started < post_body);
        assert!(post_body < post_done);
        assert!(script.trim_end().ends_with(
            "rm -f /tmp/kbb-pre-done-db /tmp/kbb-signal-db /tmp/kbb-post-started-db /tmp/kbb-post-done-db"
        ));
    }
}
