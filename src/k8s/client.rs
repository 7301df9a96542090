use anyhow::{anyhow, Result};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{api::Api, Client, Config};

use crate::error::FatalError;

/// Build a cluster client, preferring in-cluster configuration and falling
/// back to the local kubeconfig. Failure here is a cluster-auth error
/// (exit 3), distinct from workflow failures.
pub async fn init_client() -> Result<Client, FatalError> {
    let config = Config::infer()
        .await
        .map_err(|e| FatalError::ClusterAuth(format!("failed to load cluster config: {e}")))?;
    Client::try_from(config)
        .map_err(|e| FatalError::ClusterAuth(format!("failed to build cluster client: {e}")))
}

/// Check that a storage class exists before requesting clones against it.
pub async fn validate_storage_class(client: &Client, name: &str) -> Result<()> {
    let classes: Api<StorageClass> = Api::all(client.clone());
    match classes.get(name).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            Err(anyhow!("Storage class '{}' not found", name))
        }
        Err(e) => Err(anyhow!("Failed to validate storage class '{}': {}", name, e)),
    }
}

/// Read a storage class binding mode ("Immediate" or "WaitForFirstConsumer").
pub async fn storage_class_binding_mode(client: &Client, name: &str) -> Result<String> {
    let classes: Api<StorageClass> = Api::all(client.clone());
    let sc = classes.get(name).await?;
    Ok(sc
        .volume_binding_mode
        .unwrap_or_else(|| "Immediate".to_string()))
}
