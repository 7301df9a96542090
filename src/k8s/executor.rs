use anyhow::{anyhow, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, AttachParams},
    Client,
};
use tokio::io::AsyncReadExt;

/// Result of an exec-into-container call.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// Exec-into-pod helper shared by hooks and session checkpoints.
#[derive(Clone)]
pub struct PodExecutor {
    client: Client,
}

impl PodExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Run a command inside an existing container and capture both output
    /// streams. `stdin=false, tty=false` always.
    pub async fn exec(
        &self,
        namespace: &str,
        pod_name: &str,
        container: Option<&str>,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        let attach_params = AttachParams {
            container: container.map(String::from),
            stdin: false,
            stdout: true,
            stderr: true,
            tty: false,
            ..Default::default()
        };

        let mut attached = pods.exec(pod_name, command, &attach_params).await?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let Some(mut stdout_stream) = attached.stdout() {
            let mut buf = Vec::new();
            stdout_stream.read_to_end(&mut buf).await?;
            stdout = String::from_utf8_lossy(&buf).to_string();
        }

        if let Some(mut stderr_stream) = attached.stderr() {
            let mut buf = Vec::new();
            stderr_stream.read_to_end(&mut buf).await?;
            stderr = String::from_utf8_lossy(&buf).to_string();
        }

        let success = match attached.take_status() {
            Some(status_future) => match status_future.await {
                Some(status) => status.status.as_deref() == Some("Success"),
                None => false,
            },
            None => true,
        };

        Ok(ExecOutput {
            stdout,
            stderr,
            success,
        })
    }

    /// Run a shell snippet via `/bin/sh -c`.
    pub async fn exec_sh(
        &self,
        namespace: &str,
        pod_name: &str,
        container: Option<&str>,
        script: &str,
    ) -> Result<ExecOutput> {
        let command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ];
        self.exec(namespace, pod_name, container, command).await
    }

    /// Like [`exec_sh`](Self::exec_sh) but mapping a non-zero exit into an
    /// error carrying both output streams.
    pub async fn exec_sh_checked(
        &self,
        namespace: &str,
        pod_name: &str,
        container: Option<&str>,
        script: &str,
    ) -> Result<ExecOutput> {
        let output = self.exec_sh(namespace, pod_name, container, script).await?;
        if !output.success {
            return Err(anyhow!(
                "command failed in pod {pod_name} (namespace {namespace}): {script}\nstdout: {}\nstderr: {}",
                output.stdout,
                output.stderr
            ));
        }
        Ok(output)
    }

    /// Probe for the existence of a file inside a container.
    pub async fn file_exists(
        &self,
        namespace: &str,
        pod_name: &str,
        container: Option<&str>,
        path: &str,
    ) -> Result<bool> {
        let output = self
            .exec_sh(namespace, pod_name, container, &format!("test -e {path}"))
            .await?;
        Ok(output.success)
    }
}
