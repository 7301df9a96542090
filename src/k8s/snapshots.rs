//! VolumeSnapshot access through the dynamic API.
//!
//! The snapshot CRD is consumed untyped (`DynamicObject` + `ApiResource`)
//! so the crate does not pin a generated client to one CRD version.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject},
    Client, ResourceExt,
};
use serde_json::json;
use tokio::time::{sleep, Duration, Instant};

use crate::{APP_LABEL, MANAGED_BY};

pub const SNAP_GROUP: &str = "snapshot.storage.k8s.io";
pub const SNAP_VERSION: &str = "v1";
pub const SNAP_KIND: &str = "VolumeSnapshot";
pub const SNAP_PLURAL: &str = "volumesnapshots";

pub fn snapshot_resource() -> ApiResource {
    ApiResource {
        group: SNAP_GROUP.to_string(),
        version: SNAP_VERSION.to_string(),
        api_version: format!("{SNAP_GROUP}/{SNAP_VERSION}"),
        kind: SNAP_KIND.to_string(),
        plural: SNAP_PLURAL.to_string(),
    }
}

pub fn snapshot_api(client: &Client, namespace: &str) -> Api<DynamicObject> {
    Api::namespaced_with(client.clone(), namespace, &snapshot_resource())
}

/// Snapshot naming: `{pvc}-snap-{YYYYMMDDHHMMSS}` (UTC).
pub fn snapshot_name(pvc: &str, now: DateTime<Utc>) -> String {
    format!("{}-snap-{}", pvc, now.format("%Y%m%d%H%M%S"))
}

/// Whether the snapshot driver has confirmed the snapshot usable.
pub fn is_ready(snapshot: &DynamicObject) -> bool {
    snapshot
        .data
        .get("status")
        .and_then(|s| s.get("readyToUse"))
        .and_then(|r| r.as_bool())
        .unwrap_or(false)
}

/// Size the snapshot reports for restored volumes, defaulting to 1Gi when
/// the driver has not populated it.
pub fn restore_size(snapshot: &DynamicObject) -> String {
    snapshot
        .data
        .get("status")
        .and_then(|s| s.get("restoreSize"))
        .and_then(|r| r.as_str())
        .unwrap_or("1Gi")
        .to_string()
}

/// Source PVC recorded in the snapshot spec.
pub fn source_pvc(snapshot: &DynamicObject) -> Option<String> {
    snapshot
        .data
        .get("spec")
        .and_then(|s| s.get("source"))
        .and_then(|s| s.get("persistentVolumeClaimName"))
        .and_then(|p| p.as_str())
        .map(String::from)
}

/// Create a labelled VolumeSnapshot for a PVC and return its name.
pub async fn create_snapshot(
    client: &Client,
    namespace: &str,
    pvc: &str,
    snapshot_class: &str,
) -> Result<String> {
    let name = snapshot_name(pvc, Utc::now());
    let api = snapshot_api(client, namespace);

    let mut snapshot = DynamicObject::new(&name, &snapshot_resource());
    snapshot.metadata.namespace = Some(namespace.to_string());
    snapshot.metadata.labels = Some(BTreeMap::from([
        ("pvc".to_string(), pvc.to_string()),
        ("app".to_string(), APP_LABEL.to_string()),
        ("managed-by".to_string(), MANAGED_BY.to_string()),
    ]));
    snapshot.data = json!({
        "spec": {
            "volumeSnapshotClassName": snapshot_class,
            "source": {"persistentVolumeClaimName": pvc},
        }
    });

    api.create(&PostParams::default(), &snapshot)
        .await
        .with_context(|| format!("failed to create snapshot {name}"))?;
    Ok(name)
}

/// Wait for the snapshot driver to set `readyToUse=true`.
pub async fn wait_snapshot_ready(
    client: &Client,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> Result<()> {
    let api = snapshot_api(client, namespace);
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        let snapshot = api.get(name).await?;
        if is_ready(&snapshot) {
            return Ok(());
        }
        sleep(Duration::from_secs(2)).await;
    }

    Err(anyhow!(
        "snapshot {name} not ready after {}s",
        timeout.as_secs()
    ))
}

/// List snapshots of one source PVC via the `pvc` label selector.
pub async fn list_snapshots_for_pvc(
    client: &Client,
    namespace: &str,
    pvc: &str,
) -> Result<Vec<DynamicObject>> {
    let api = snapshot_api(client, namespace);
    let params = ListParams::default().labels(&format!("pvc={pvc}"));
    let list = api
        .list(&params)
        .await
        .with_context(|| format!("failed to list snapshots for {pvc}"))?;
    Ok(list.items)
}

/// Resolve the newest ready snapshot for a PVC, if any.
pub async fn latest_ready_snapshot(
    client: &Client,
    namespace: &str,
    pvc: &str,
) -> Result<Option<String>> {
    let mut items: Vec<DynamicObject> = list_snapshots_for_pvc(client, namespace, pvc)
        .await?
        .into_iter()
        .filter(is_ready_ref)
        .collect();
    items.sort_by_key(|s| {
        s.metadata
            .creation_timestamp
            .as_ref()
            .map(|t| crate::k8s::jiff_to_chrono(t.0))
            .unwrap_or_default()
    });
    Ok(items.last().map(|s| s.name_any()))
}

fn is_ready_ref(snapshot: &DynamicObject) -> bool {
    is_ready(snapshot)
}

pub async fn get_snapshot(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<DynamicObject> {
    snapshot_api(client, namespace)
        .get(name)
        .await
        .with_context(|| format!("failed to read snapshot {name}"))
}

pub async fn delete_snapshot(client: &Client, namespace: &str, name: &str) -> Result<()> {
    snapshot_api(client, namespace)
        .delete(name, &DeleteParams::default())
        .await
        .with_context(|| format!("failed to delete snapshot {name}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_name_format() {
        let now = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(snapshot_name("a", now), "a-snap-20250101000000");
    }

    #[test]
    fn test_readiness_and_size_extraction() {
        let mut snap = DynamicObject::new("s", &snapshot_resource());
        assert!(!is_ready(&snap));
        assert_eq!(restore_size(&snap), "1Gi");

        snap.data = json!({"status": {"readyToUse": true, "restoreSize": "8Gi"}});
        assert!(is_ready(&snap));
        assert_eq!(restore_size(&snap), "8Gi");
    }

    #[test]
    fn test_source_pvc_extraction() {
        let mut snap = DynamicObject::new("s", &snapshot_resource());
        assert_eq!(source_pvc(&snap), None);
        snap.data = json!({"spec": {"source": {"persistentVolumeClaimName": "data"}}});
        assert_eq!(source_pvc(&snap).as_deref(), Some("data"));
    }
}
