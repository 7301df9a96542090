//! Clone PVC provisioning and the two-mode readiness wait.
//!
//! `Bound` is necessary but not sufficient: Longhorn reports clones Bound
//! before the underlying volume can be attached, so Bound volumes on that
//! driver additionally need `state=attached` and `robustness=healthy` on
//! the driver's own volume CRD plus a settling delay for the CSI node
//! plugin. Under WaitForFirstConsumer the PVC stays Pending until a pod is
//! scheduled; the "WaitForFirstConsumer" event is the readiness signal.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Event, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    TypedLocalObjectReference, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, ListParams, PostParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::time::{sleep, Duration, Instant};
use tracing::{info, warn};

use crate::k8s::snapshots::{self, SNAP_GROUP};
use crate::{APP_LABEL, MANAGED_BY};

const LONGHORN_CSI_DRIVER: &str = "driver.longhorn.io";
/// Longhorn always installs into this namespace; it is a driver
/// convention, not user-configurable.
const LONGHORN_NAMESPACE: &str = "longhorn-system";
/// Extra delay after attached+healthy for the CSI node plugin to publish
/// the volume.
const LONGHORN_SETTLE: Duration = Duration::from_secs(15);

/// Matcher for provisioning failures surfaced only through events.
static EVENT_ERROR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)ProvisioningFailed|not found|failed|error|cannot|unable")
        .expect("Invalid EVENT_ERROR_RE pattern")
});

/// Clone naming: `{snapshotName}-clone-{YYYYMMDDHHMMSS}` (UTC).
pub fn clone_name(snapshot: &str, now: DateTime<Utc>) -> String {
    format!("{}-clone-{}", snapshot, now.format("%Y%m%d%H%M%S"))
}

/// Create a clone PVC from a VolumeSnapshot, sized from the snapshot's
/// restore size and restricted to a single writer on a single pod. A
/// missing storage class falls back to the cluster default.
pub async fn create_clone(
    client: &Client,
    namespace: &str,
    snapshot_name: &str,
    clone: &str,
    storage_class: Option<&str>,
) -> Result<()> {
    let snapshot = snapshots::get_snapshot(client, namespace, snapshot_name).await?;
    let size = snapshots::restore_size(&snapshot);

    let pvc = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(clone.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                ("app".to_string(), APP_LABEL.to_string()),
                ("managed-by".to_string(), MANAGED_BY.to_string()),
            ])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOncePod".to_string()]),
            storage_class_name: storage_class.map(String::from),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size),
                )])),
                ..Default::default()
            }),
            data_source: Some(TypedLocalObjectReference {
                api_group: Some(SNAP_GROUP.to_string()),
                kind: "VolumeSnapshot".to_string(),
                name: snapshot_name.to_string(),
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    pvcs.create(&PostParams::default(), &pvc)
        .await
        .with_context(|| format!("failed to create clone PVC {clone}"))?;
    Ok(())
}

/// Wait until the clone is usable: Bound (plus driver readiness on
/// Longhorn) or confirmed WaitForFirstConsumer. Bounded by
/// `cloneBindTimeout`.
pub async fn wait_clone_ready(
    client: &Client,
    namespace: &str,
    pvc_name: &str,
    timeout: Duration,
) -> Result<()> {
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    let start = Instant::now();
    let deadline = start + timeout;
    let mut last_event_check: Option<Instant> = None;

    loop {
        if Instant::now() >= deadline {
            // Final event check to surface the actual error.
            if let Some(msg) = pvc_error_event(client, namespace, pvc_name).await? {
                bail!("PVC {pvc_name} provisioning failed: {msg}");
            }
            bail!(
                "timeout waiting for PVC {pvc_name} after {}s",
                start.elapsed().as_secs()
            );
        }

        let pvc = pvcs
            .get(pvc_name)
            .await
            .with_context(|| format!("failed to read PVC {pvc_name}"))?;
        let phase = pvc
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown");

        match phase {
            "Bound" => {
                info!(
                    pvc = %pvc_name,
                    elapsed = start.elapsed().as_secs(),
                    "Clone PVC is Bound"
                );
                if let Some(pv_name) = longhorn_pv_name(client, &pvc).await {
                    info!("Longhorn volume detected, waiting for workload readiness...");
                    wait_longhorn_ready(client, &pv_name, deadline).await?;
                }
                return Ok(());
            }
            "Pending" => {
                let due = last_event_check
                    .map(|t| t.elapsed() >= Duration::from_secs(10))
                    .unwrap_or(true);
                if due {
                    last_event_check = Some(Instant::now());
                    let events = pvc_events(client, namespace, pvc_name).await?;
                    if let Some(msg) = error_event_message(&events) {
                        bail!("PVC {pvc_name} provisioning failed: {msg}");
                    }
                    if has_wait_for_first_consumer(&events) {
                        info!(
                            pvc = %pvc_name,
                            elapsed = start.elapsed().as_secs(),
                            "Clone PVC waiting for first consumer, ready to attach"
                        );
                        return Ok(());
                    }
                }
            }
            other => warn!(pvc = %pvc_name, phase = %other, "Unexpected PVC phase"),
        }

        sleep(Duration::from_secs(5)).await;
    }
}

/// PV name behind the claim when the volume is provisioned by Longhorn.
async fn longhorn_pv_name(client: &Client, pvc: &PersistentVolumeClaim) -> Option<String> {
    let volume_name = pvc.spec.as_ref()?.volume_name.clone()?;
    let pvs: Api<PersistentVolume> = Api::all(client.clone());
    let pv = pvs.get(&volume_name).await.ok()?;
    let driver = pv.spec?.csi?.driver;
    (driver == LONGHORN_CSI_DRIVER).then_some(volume_name)
}

fn longhorn_volume_resource() -> ApiResource {
    ApiResource {
        group: "longhorn.io".to_string(),
        version: "v1beta2".to_string(),
        api_version: "longhorn.io/v1beta2".to_string(),
        kind: "Volume".to_string(),
        plural: "volumes".to_string(),
    }
}

async fn wait_longhorn_ready(client: &Client, pv_name: &str, deadline: Instant) -> Result<()> {
    let started = Instant::now();
    while Instant::now() < deadline {
        if longhorn_volume_ready(client, pv_name).await? {
            info!(
                volume = %pv_name,
                elapsed = started.elapsed().as_secs(),
                "Longhorn volume is attached and healthy"
            );
            sleep(LONGHORN_SETTLE).await;
            return Ok(());
        }
        sleep(Duration::from_secs(2)).await;
    }
    warn!(volume = %pv_name, "Longhorn volume not ready before deadline, proceeding anyway");
    Ok(())
}

/// Query the Longhorn volume CRD. `state=attached` plus
/// `robustness=healthy` means the volume can be attached to a workload.
/// 401/403 means the service account lacks the Longhorn RBAC rules and the
/// run must fail rather than poll forever.
async fn longhorn_volume_ready(client: &Client, pv_name: &str) -> Result<bool> {
    let api: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), LONGHORN_NAMESPACE, &longhorn_volume_resource());

    match api.get(pv_name).await {
        Ok(volume) => {
            let status = volume.data.get("status");
            let state = status
                .and_then(|s| s.get("state"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            let robustness = status
                .and_then(|s| s.get("robustness"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            Ok(state == "attached" && robustness == "healthy")
        }
        Err(kube::Error::Api(ae)) if ae.code == 401 || ae.code == 403 => Err(anyhow!(
            "RBAC error querying volumes.longhorn.io ({}): {}. The ServiceAccount needs a \
             ClusterRole with apiGroups ['longhorn.io'], resources ['volumes'], verbs \
             ['get', 'list']",
            ae.code,
            ae.message
        )),
        Err(e) => {
            // Not found or a transient API failure: treat the volume as
            // ready rather than stalling a non-Longhorn-managed PV.
            warn!(volume = %pv_name, "Could not query Longhorn volume ({e}), proceeding");
            Ok(true)
        }
    }
}

async fn pvc_events(client: &Client, namespace: &str, pvc_name: &str) -> Result<Vec<Event>> {
    let events: Api<Event> = Api::namespaced(client.clone(), namespace);
    let params = ListParams::default().fields(&format!(
        "involvedObject.name={pvc_name},involvedObject.kind=PersistentVolumeClaim"
    ));
    Ok(events.list(&params).await?.items)
}

async fn pvc_error_event(
    client: &Client,
    namespace: &str,
    pvc_name: &str,
) -> Result<Option<String>> {
    let events = pvc_events(client, namespace, pvc_name).await.unwrap_or_default();
    Ok(error_event_message(&events))
}

/// First Warning/Error event whose message looks like a provisioning
/// failure.
pub fn error_event_message(events: &[Event]) -> Option<String> {
    events
        .iter()
        .filter(|e| matches!(e.type_.as_deref(), Some("Warning") | Some("Error")))
        .filter_map(|e| e.message.as_deref())
        .find(|m| EVENT_ERROR_RE.is_match(m))
        .map(String::from)
}

pub fn has_wait_for_first_consumer(events: &[Event]) -> bool {
    events.iter().filter_map(|e| e.message.as_deref()).any(|m| {
        m.contains("WaitForFirstConsumer") || m.contains("waiting for first consumer")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(type_: &str, message: &str) -> Event {
        Event {
            type_: Some(type_.to_string()),
            message: Some(message.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_clone_name_format() {
        let now = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            clone_name("a-snap-20250101000000", now),
            "a-snap-20250101000000-clone-20250101000000"
        );
    }

    #[test]
    fn test_error_event_matching() {
        let events = vec![
            event("Normal", "Provisioning volume"),
            event("Warning", "ProvisioningFailed: no space"),
        ];
        assert_eq!(
            error_event_message(&events).as_deref(),
            Some("ProvisioningFailed: no space")
        );
    }

    #[test]
    fn test_error_keywords_case_insensitive() {
        let events = vec![event("Warning", "storageclass \"fast\" NOT FOUND")];
        assert!(error_event_message(&events).is_some());
    }

    #[test]
    fn test_normal_events_not_errors() {
        // Keyword in a Normal event must not fail the wait.
        let events = vec![event("Normal", "waiting for first consumer to be created")];
        assert_eq!(error_event_message(&events), None);
        assert!(has_wait_for_first_consumer(&events));
    }

    #[test]
    fn test_wait_for_first_consumer_detection() {
        let events = vec![event("Normal", "WaitForFirstConsumer binding mode")];
        assert!(has_wait_for_first_consumer(&events));
        assert!(!has_wait_for_first_consumer(&[event("Normal", "Provisioning")]));
    }
}
