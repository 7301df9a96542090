//! Pod observation: an event watch and a log follower per pod, both tied
//! to one cancellation token, plus the terminal-phase wait the workflows
//! block on.

use std::collections::HashSet;

use anyhow::Result;
use futures::{AsyncBufReadExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::{
    api::{Api, LogParams},
    runtime::watcher,
    Client,
};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, info, warn};
use tokio_util::sync::CancellationToken;

/// Background observation of one pod.
pub struct PodMonitor {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl PodMonitor {
    /// Spawn the event and log streams for a pod.
    pub fn start(client: &Client, namespace: &str, pod_name: &str) -> Self {
        let token = CancellationToken::new();
        let mut handles = Vec::new();

        {
            let client = client.clone();
            let namespace = namespace.to_string();
            let pod_name = pod_name.to_string();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                stream_events(client, namespace, pod_name, token).await;
            }));
        }
        {
            let client = client.clone();
            let namespace = namespace.to_string();
            let pod_name = pod_name.to_string();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                stream_logs(client, namespace, pod_name, token).await;
            }));
        }

        Self { token, handles }
    }

    /// Signal the streams to stop and join them with a small timeout.
    pub async fn stop(self) {
        self.token.cancel();
        for handle in self.handles {
            let _ = timeout(Duration::from_secs(5), handle).await;
        }
    }
}

/// Follow pod events until cancelled.
///
/// The watcher resumes from the list-level resourceVersion it tracks
/// internally and re-lists on 410, so reconnects never replay from a
/// per-event object version. Replays that do occur after a re-list are
/// swallowed by the seen-set, keyed on (uid, resourceVersion).
async fn stream_events(
    client: Client,
    namespace: String,
    pod_name: String,
    token: CancellationToken,
) {
    let api: Api<Event> = Api::namespaced(client, &namespace);
    let config = watcher::Config::default()
        .fields(&format!(
            "involvedObject.kind=Pod,involvedObject.name={pod_name}"
        ))
        .timeout(60);

    let stream = watcher(api, config);
    futures::pin_mut!(stream);

    let mut seen: HashSet<(String, String)> = HashSet::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            item = stream.next() => match item {
                Some(Ok(watcher::Event::Apply(event)))
                | Some(Ok(watcher::Event::InitApply(event))) => {
                    let key = (
                        event.metadata.uid.clone().unwrap_or_default(),
                        event.metadata.resource_version.clone().unwrap_or_default(),
                    );
                    if !seen.insert(key) {
                        continue;
                    }
                    info!(
                        pod = %pod_name,
                        "[EVENT] {}: {}",
                        event.reason.as_deref().unwrap_or("Unknown"),
                        event.message.as_deref().unwrap_or("")
                    );
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(pod = %pod_name, "Event watch interrupted: {e}");
                    sleep(Duration::from_secs(1)).await;
                }
                None => break,
            }
        }
    }
}

/// Follow pod logs until cancelled. Waits for the container to be running
/// (or already terminated) before opening the follow stream; a 400 Bad
/// Request means the pod completed first, in which case a single
/// non-follow fetch retrieves everything.
async fn stream_logs(
    client: Client,
    namespace: String,
    pod_name: String,
    token: CancellationToken,
) {
    let pods: Api<Pod> = Api::namespaced(client, &namespace);

    loop {
        if token.is_cancelled() {
            return;
        }
        match pods.get(&pod_name).await {
            Ok(pod) => {
                if container_started(&pod) {
                    break;
                }
            }
            Err(e) => debug!(pod = %pod_name, "Waiting for pod: {e}"),
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = sleep(Duration::from_secs(2)) => {}
        }
    }

    let params = LogParams {
        follow: true,
        ..Default::default()
    };

    match pods.log_stream(&pod_name, &params).await {
        Ok(stream) => {
            let mut lines = stream.lines();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    line = lines.try_next() => match line {
                        Ok(Some(line)) => {
                            if !line.is_empty() {
                                info!("[{pod_name}] {line}");
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            if !token.is_cancelled() {
                                warn!(pod = %pod_name, "Log streaming ended: {e}");
                            }
                            break;
                        }
                    }
                }
            }
        }
        Err(kube::Error::Api(ae)) if ae.code == 400 => {
            // Pod already completed: fetch everything in one shot.
            match pods.logs(&pod_name, &LogParams::default()).await {
                Ok(logs) => {
                    for line in logs.lines().filter(|l| !l.trim().is_empty()) {
                        info!("[{pod_name}] {line}");
                    }
                }
                Err(e) => {
                    if !token.is_cancelled() {
                        warn!(pod = %pod_name, "Could not retrieve logs: {e}");
                    }
                }
            }
        }
        Err(e) => {
            if !token.is_cancelled() {
                warn!(pod = %pod_name, "Log streaming failed: {e}");
            }
        }
    }
}

fn container_started(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses.iter().any(|cs| {
                cs.state
                    .as_ref()
                    .map(|state| {
                        state
                            .running
                            .as_ref()
                            .is_some_and(|r| r.started_at.is_some())
                            || state.terminated.is_some()
                    })
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

/// Observe a pod to a terminal phase, streaming its events and logs.
/// Returns true for Succeeded, false for Failed or timeout. The caller
/// owns pod deletion.
pub async fn wait_pod_done(
    client: &Client,
    namespace: &str,
    pod_name: &str,
    timeout_after: Option<Duration>,
) -> Result<bool> {
    let monitor = PodMonitor::start(client, namespace, pod_name);
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let deadline = timeout_after.map(|t| Instant::now() + t);

    let outcome = loop {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                warn!(pod = %pod_name, "Pod did not complete before timeout");
                break false;
            }
        }

        match pods.get(pod_name).await {
            Ok(pod) => {
                let phase = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .unwrap_or("Unknown");
                match phase {
                    "Succeeded" => {
                        info!(pod = %pod_name, "Pod completed successfully");
                        break true;
                    }
                    "Failed" => {
                        warn!(pod = %pod_name, "Pod failed");
                        break false;
                    }
                    _ => {}
                }
            }
            Err(e) => {
                warn!(pod = %pod_name, "Error reading pod: {e}");
                break false;
            }
        }

        sleep(Duration::from_secs(10)).await;
    };

    monitor.stop().await;
    Ok(outcome)
}

/// One-shot fetch of a completed pod's logs (list output parsing, failure
/// context).
pub async fn fetch_logs(client: &Client, namespace: &str, pod_name: &str) -> Result<String> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    Ok(pods.logs(pod_name, &LogParams::default()).await?)
}

/// List pod helper used by `kbb backup list`: wait for a terminal phase
/// without log streaming (stdout must stay parseable).
pub async fn wait_pod_done_quiet(
    client: &Client,
    namespace: &str,
    pod_name: &str,
    timeout_after: Duration,
) -> Result<bool> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let deadline = Instant::now() + timeout_after;

    while Instant::now() < deadline {
        let pod = pods.get(pod_name).await?;
        match pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown")
        {
            "Succeeded" => return Ok(true),
            "Failed" => return Ok(false),
            _ => sleep(Duration::from_secs(2)).await,
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStatus,
        PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn pod_with_state(state: ContainerState) -> Pod {
        Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    state: Some(state),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_container_started_running() {
        let pod = pod_with_state(ContainerState {
            running: Some(ContainerStateRunning {
                started_at: Some(Time(k8s_openapi::jiff::Timestamp::now())),
            }),
            ..Default::default()
        });
        assert!(container_started(&pod));
    }

    #[test]
    fn test_container_started_terminated() {
        let pod = pod_with_state(ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: 0,
                ..Default::default()
            }),
            ..Default::default()
        });
        assert!(container_started(&pod));
    }

    #[test]
    fn test_container_not_started() {
        assert!(!container_started(&Pod::default()));
        let pod = pod_with_state(ContainerState::default());
        assert!(!container_started(&pod));
    }
}
