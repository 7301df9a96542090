//! In-memory set of ephemeral objects the process has created.
//!
//! Every clone PVC, worker pod, and ephemeral secret is registered here the
//! moment it is created and removed once it is deleted. On any terminating
//! exit path (including SIGTERM) the tracker is drained: each remaining
//! object is deleted best-effort and failures are logged with the object
//! name so nothing disappears silently.

use anyhow::Result;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret};
use kube::{
    api::{Api, DeleteParams},
    Client,
};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::{info, warn};

#[derive(Default)]
struct Tracked {
    clone_pvcs: Vec<String>,
    worker_pods: Vec<String>,
    secrets: Vec<String>,
}

pub struct ResourceTracker {
    client: Client,
    namespace: String,
    inner: Mutex<Tracked>,
}

impl ResourceTracker {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            inner: Mutex::new(Tracked::default()),
        }
    }

    pub async fn track_clone(&self, name: &str) {
        self.inner.lock().await.clone_pvcs.push(name.to_string());
    }

    pub async fn track_pod(&self, name: &str) {
        self.inner.lock().await.worker_pods.push(name.to_string());
    }

    pub async fn track_secret(&self, name: &str) {
        self.inner.lock().await.secrets.push(name.to_string());
    }

    /// Delete a clone PVC and stop tracking it. Errors are ignored; a
    /// missing object is the desired state.
    pub async fn delete_clone(&self, name: &str) {
        let pvcs: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &self.namespace);
        let _ = pvcs.delete(name, &DeleteParams::default()).await;
        self.inner.lock().await.clone_pvcs.retain(|n| n != name);
    }

    /// Delete a secret and stop tracking it.
    pub async fn delete_secret(&self, name: &str) {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let _ = secrets.delete(name, &DeleteParams::default()).await;
        self.inner.lock().await.secrets.retain(|n| n != name);
    }

    /// Delete a worker pod, waiting for the API to confirm it gone, and
    /// stop tracking it.
    pub async fn delete_pod(&self, name: &str) {
        if let Err(e) = delete_pod_graceful(&self.client, &self.namespace, name).await {
            warn!(pod = %name, "Failed to delete pod: {e}");
        }
        self.inner.lock().await.worker_pods.retain(|n| n != name);
    }

    /// Delete every tracked object. Called on normal completion paths that
    /// bail out early and from the signal handler.
    pub async fn drain(&self) {
        let tracked = {
            let mut inner = self.inner.lock().await;
            std::mem::take(&mut *inner)
        };

        if tracked.secrets.is_empty()
            && tracked.worker_pods.is_empty()
            && tracked.clone_pvcs.is_empty()
        {
            return;
        }

        info!("Cleaning up all tracked resources...");

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        for name in &tracked.secrets {
            info!(secret = %name, "Deleting config secret");
            if let Err(e) = secrets.delete(name, &DeleteParams::default()).await {
                warn!(secret = %name, "Failed to delete secret: {e}");
            }
        }

        for name in &tracked.worker_pods {
            info!(pod = %name, "Deleting worker pod");
            if let Err(e) = delete_pod_graceful(&self.client, &self.namespace, name).await {
                warn!(pod = %name, "Failed to delete pod: {e}");
            }
        }

        let pvcs: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &self.namespace);
        for name in &tracked.clone_pvcs {
            info!(pvc = %name, "Deleting clone PVC");
            if let Err(e) = pvcs.delete(name, &DeleteParams::default()).await {
                warn!(pvc = %name, "Failed to delete PVC: {e}");
            }
        }

        info!("Cleanup complete");
    }
}

/// Delete a pod and poll for the authoritative 404 for up to 30 seconds;
/// if the pod is still present after that, force-delete with grace 0.
pub async fn delete_pod_graceful(client: &Client, namespace: &str, name: &str) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);

    match pods.delete(name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        match pods.get(name).await {
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            _ => sleep(Duration::from_secs(2)).await,
        }
    }

    warn!(pod = %name, "Pod still present after 30s, force-deleting with grace 0");
    match pods
        .delete(name, &DeleteParams::default().grace_period(0))
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}
