use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use crate::error::FatalError;
use crate::hooks::session::collect_sessions;

use super::types::Config;

/// Default config location inside a pod (mounted from a secret).
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// Resolve the config file path: CLI argument, then `APP_CONFIG`, then the
/// mounted default.
pub fn resolve_config_path(cli_path: Option<&str>) -> PathBuf {
    if let Some(path) = cli_path.filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    if let Ok(env_path) = std::env::var("APP_CONFIG") {
        if !env_path.is_empty() {
            return PathBuf::from(env_path);
        }
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

/// Load the configuration document. Field validation is per-workflow; see
/// [`validate_for_snapshot`] and [`validate_for_backup`].
pub fn load(cli_path: Option<&str>) -> Result<Config, FatalError> {
    let path = resolve_config_path(cli_path);

    let content = fs::read_to_string(&path)
        .map_err(|e| FatalError::Config(format!("failed to read {}: {e}", path.display())))?;

    parse(&content)
        .map_err(|e| FatalError::Config(format!("failed to parse {}: {e}", path.display())))
}

fn parse(content: &str) -> Result<Config, serde_yaml::Error> {
    // The root must be a mapping; serde_yaml enforces that through the
    // struct deserialization itself.
    serde_yaml::from_str(content)
}

/// Validate the fields the snapshot workflow consumes.
pub fn validate_for_snapshot(config: &Config) -> Result<(), FatalError> {
    let mut missing = Vec::new();
    if config.namespace.as_deref().unwrap_or("").is_empty() {
        missing.push("namespace");
    }
    for entry in &config.snapshots.pvcs {
        if entry.name.is_empty() {
            missing.push("snapshots.pvcs[].name");
        }
        if entry.snapshot_class.as_deref().unwrap_or("").is_empty() {
            missing.push("snapshots.pvcs[].snapshotClass");
        }
    }
    if !missing.is_empty() {
        return Err(FatalError::Config(format!(
            "missing required fields: {}",
            missing.join(", ")
        )));
    }

    // Session-linked hooks must pair up one pre with one post per id.
    let pre: Vec<_> = config
        .snapshots
        .pvcs
        .iter()
        .flat_map(|p| p.hooks.pre.iter().cloned())
        .collect();
    let post: Vec<_> = config
        .snapshots
        .pvcs
        .iter()
        .flat_map(|p| p.hooks.post.iter().cloned())
        .collect();
    collect_sessions(&pre, &post).map_err(|e| FatalError::Config(e.to_string()))?;

    Ok(())
}

/// Validate the fields the backup workflow consumes. Per-entry fields
/// (`class`, `timeout`) are checked in the workflow itself so that one bad
/// entry does not abort the others.
pub fn validate_for_backup(config: &Config) -> Result<(), FatalError> {
    let mut missing = Vec::new();
    if config.namespace.as_deref().unwrap_or("").is_empty() {
        missing.push("namespace");
    }
    if config.release_name.as_deref().unwrap_or("").is_empty() {
        missing.push("releaseName");
    }
    if config.borg_repo.as_deref().unwrap_or("").is_empty() {
        missing.push("borgRepo");
    }
    if config.borg_passphrase.as_deref().unwrap_or("").is_empty() {
        missing.push("borgPassphrase");
    }
    if config.ssh_private_key.as_deref().unwrap_or("").is_empty() {
        missing.push("sshPrivateKey");
    }
    if !missing.is_empty() {
        return Err(FatalError::Config(format!(
            "missing required fields: {}",
            missing.join(", ")
        )));
    }

    // Two entries sharing a name would write archives under the same
    // prefix and prune each other's revisions.
    let mut seen: HashSet<&str> = HashSet::new();
    for entry in &config.backups {
        if !seen.insert(entry.name.as_str()) {
            return Err(FatalError::Config(format!(
                "duplicate backup entry name: {}",
                entry.name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BACKUP_DOC: &str = r#"
namespace: prod
releaseName: my-release
borgRepo: ssh://borg@host/./repo
borgPassphrase: secret
sshPrivateKey: keydata
backups:
  - name: app-a
    pvc: a
    class: immediate
    timeout: 600
    cloneBindTimeout: 120
  - name: app-b
    pvc: b
    class: immediate
    timeout: 600
retention:
  daily: 7
  weekly: 4
"#;

    #[test]
    fn test_parse_backup_document() {
        let cfg = parse(BACKUP_DOC).unwrap();
        assert_eq!(cfg.backups.len(), 2);
        assert_eq!(cfg.backups[0].clone_bind_timeout, 120);
        assert_eq!(cfg.backups[1].clone_bind_timeout, 300);
        validate_for_backup(&cfg).unwrap();
    }

    #[test]
    fn test_backup_validation_names_every_missing_field() {
        let cfg = parse("namespace: prod\n").unwrap();
        let err = validate_for_backup(&cfg).unwrap_err().to_string();
        assert!(err.contains("releaseName"));
        assert!(err.contains("borgRepo"));
        assert!(err.contains("borgPassphrase"));
        assert!(err.contains("sshPrivateKey"));
        assert!(!err.contains("namespace,"));
    }

    #[test]
    fn test_duplicate_entry_names_rejected() {
        let doc = format!(
            "{}  - name: app-a\n    pvc: c\n    class: immediate\n    timeout: 60\n",
            BACKUP_DOC
        );
        let cfg = parse(&doc).unwrap();
        let err = validate_for_backup(&cfg).unwrap_err().to_string();
        assert!(err.contains("duplicate backup entry name: app-a"));
    }

    #[test]
    fn test_snapshot_validation() {
        let cfg = parse(
            "namespace: prod\nsnapshots:\n  pvcs:\n    - name: data\n      snapshotClass: longhorn\n",
        )
        .unwrap();
        validate_for_snapshot(&cfg).unwrap();

        let cfg = parse("namespace: prod\nsnapshots:\n  pvcs:\n    - name: data\n").unwrap();
        let err = validate_for_snapshot(&cfg).unwrap_err().to_string();
        assert!(err.contains("snapshotClass"));
    }

    #[test]
    fn test_resolve_path_precedence() {
        assert_eq!(
            resolve_config_path(Some("/tmp/x.yaml")),
            PathBuf::from("/tmp/x.yaml")
        );
        assert_eq!(resolve_config_path(None), PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn test_root_must_be_mapping() {
        assert!(parse("- just\n- a\n- list\n").is_err());
    }
}
