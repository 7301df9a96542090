//! Worker pod manifests.
//!
//! Every pod is single-container, `restartPolicy=Never`, and mounts the
//! ephemeral config secret read-only at /config. Backup pods additionally
//! mount the data volume read-only at /data and the borg cache read-write
//! at /cache.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, Pod, PodSpec, SecretVolumeSource,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::config::PodConfig;
use crate::{APP_LABEL, MANAGED_BY};

/// Worker pod naming: `{releaseName}-backup-runner-{entryName}-{YYYYMMDDHHMMSS}`.
pub fn backup_pod_name(release_name: &str, entry_name: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}-backup-runner-{}-{}",
        release_name,
        entry_name,
        now.format("%Y%m%d%H%M%S")
    )
}

/// Ephemeral secret naming: `{podName}-config`.
pub fn config_secret_name(pod_name: &str) -> String {
    format!("{pod_name}-config")
}

fn base_labels(operation: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), APP_LABEL.to_string()),
        ("managed-by".to_string(), MANAGED_BY.to_string()),
        ("operation".to_string(), operation.to_string()),
    ])
}

fn secret_volume(name: &str, secret_name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pvc_volume(name: &str, claim: &str, read_only: bool) -> Volume {
    Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.to_string(),
            read_only: read_only.then_some(true),
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

/// Backup worker pod: drives `borg create` against the mounted data volume.
#[allow(clippy::too_many_arguments)]
pub fn build_backup_pod(
    pod_name: &str,
    namespace: &str,
    entry_name: &str,
    pod_config: &PodConfig,
    config_secret: &str,
    data_pvc: &str,
    cache_pvc: &str,
    deadline_secs: u64,
) -> Pod {
    let mut labels = base_labels("backup");
    labels.insert("backup".to_string(), entry_name.to_string());

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            active_deadline_seconds: Some(deadline_secs as i64),
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "backup-runner".to_string(),
                image: Some(pod_config.image.reference()),
                image_pull_policy: Some(pod_config.image.pull_policy.clone()),
                command: Some(vec!["backup-runner".to_string(), "backup".to_string()]),
                security_context: Some(SecurityContext {
                    privileged: Some(pod_config.privileged),
                    ..Default::default()
                }),
                volume_mounts: Some(vec![
                    mount("config", "/config", true),
                    mount("data", "/data", true),
                    mount("cache", "/cache", false),
                ]),
                resources: pod_config.resources.clone(),
                ..Default::default()
            }],
            volumes: Some(vec![
                secret_volume("config", config_secret),
                pvc_volume("data", data_pvc, true),
                pvc_volume("cache", cache_pvc, false),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Archive-restore worker pod: FUSE-mounts a revision and rsyncs it into
/// the target volume. Privileged for FUSE, no deadline (large restores can
/// take hours).
pub fn build_restore_pod(
    pod_name: &str,
    namespace: &str,
    pod_config: &PodConfig,
    config_secret: &str,
    cache_pvc: &str,
    target_pvc: &str,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(base_labels("restore")),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "borg-restore".to_string(),
                image: Some(pod_config.image.reference()),
                image_pull_policy: Some(pod_config.image.pull_policy.clone()),
                command: Some(vec!["backup-runner".to_string(), "restore".to_string()]),
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    ..Default::default()
                }),
                volume_mounts: Some(vec![
                    mount("config", "/config", true),
                    mount("cache", "/root/.cache/borg", false),
                    mount("target", "/target", false),
                ]),
                ..Default::default()
            }],
            volumes: Some(vec![
                secret_volume("config", config_secret),
                pvc_volume("cache", cache_pvc, false),
                pvc_volume("target", target_pvc, false),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// List worker pod: emits the archive listing JSON and exits.
pub fn build_list_pod(
    pod_name: &str,
    namespace: &str,
    pod_config: &PodConfig,
    config_secret: &str,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(base_labels("list")),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "borg-list".to_string(),
                image: Some(pod_config.image.reference()),
                image_pull_policy: Some("Always".to_string()),
                command: Some(vec!["backup-runner".to_string(), "list".to_string()]),
                volume_mounts: Some(vec![mount("config", "/config", true)]),
                ..Default::default()
            }],
            volumes: Some(vec![secret_volume("config", config_secret)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Rsync pod for snapshot restores: copies the clone into the target
/// volume. Privileged because clones keep the ownership and modes of the
/// snapshotted application data.
pub fn build_rsync_pod(
    pod_name: &str,
    namespace: &str,
    image: &str,
    source_pvc: &str,
    target_pvc: &str,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(base_labels("rsync")),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "rsync".to_string(),
                image: Some(image.to_string()),
                command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
                args: Some(vec![
                    "apk add --no-cache rsync && rsync -av --delete /source/ /target/"
                        .to_string(),
                ]),
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    ..Default::default()
                }),
                volume_mounts: Some(vec![
                    mount("source", "/source", true),
                    mount("target", "/target", false),
                ]),
                ..Default::default()
            }],
            volumes: Some(vec![
                pvc_volume("source", source_pvc, true),
                pvc_volume("target", target_pvc, false),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PodConfig;

    fn ts() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_pod_and_secret_naming() {
        let pod = backup_pod_name("rel", "app-a", ts());
        assert_eq!(pod, "rel-backup-runner-app-a-20250101000000");
        assert_eq!(config_secret_name(&pod), format!("{pod}-config"));
    }

    #[test]
    fn test_backup_pod_manifest() {
        let pod = build_backup_pod(
            "p",
            "ns",
            "app-a",
            &PodConfig::default(),
            "p-config",
            "clone-pvc",
            "borg-cache",
            600,
        );
        let spec = pod.spec.unwrap();
        assert_eq!(spec.active_deadline_seconds, Some(600));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));

        let container = &spec.containers[0];
        assert_eq!(container.name, "backup-runner");
        assert_eq!(
            container.command.as_ref().unwrap(),
            &vec!["backup-runner".to_string(), "backup".to_string()]
        );
        let mounts = container.volume_mounts.as_ref().unwrap();
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[0].mount_path, "/config");
        assert_eq!(mounts[0].read_only, Some(true));
        assert_eq!(mounts[1].mount_path, "/data");
        assert_eq!(mounts[1].read_only, Some(true));
        assert_eq!(mounts[2].mount_path, "/cache");
        assert_eq!(mounts[2].read_only, None);

        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get("backup").map(String::as_str), Some("app-a"));
        assert_eq!(
            labels.get("managed-by").map(String::as_str),
            Some("kube-borg-backup")
        );

        // The data volume itself is read-only too.
        let volumes = spec.volumes.unwrap();
        let data = volumes.iter().find(|v| v.name == "data").unwrap();
        assert_eq!(
            data.persistent_volume_claim.as_ref().unwrap().read_only,
            Some(true)
        );
    }

    #[test]
    fn test_restore_pod_has_no_deadline() {
        let pod = build_restore_pod("p", "ns", &PodConfig::default(), "s", "cache", "target");
        let spec = pod.spec.unwrap();
        assert_eq!(spec.active_deadline_seconds, None);
        let container = &spec.containers[0];
        assert_eq!(
            container.security_context.as_ref().unwrap().privileged,
            Some(true)
        );
        let mounts = container.volume_mounts.as_ref().unwrap();
        assert!(mounts.iter().any(|m| m.mount_path == "/root/.cache/borg"));
        assert!(mounts.iter().any(|m| m.mount_path == "/target"));
    }

    #[test]
    fn test_rsync_pod_command() {
        let pod = build_rsync_pod("p", "ns", "alpine:latest", "src", "dst");
        let spec = pod.spec.unwrap();
        let container = &spec.containers[0];
        assert!(container.args.as_ref().unwrap()[0].contains("rsync -av --delete /source/ /target/"));
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get("operation").map(String::as_str), Some("rsync"));
    }
}
