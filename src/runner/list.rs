//! The list operation: emit the repository's archives as one JSON object
//! on stdout. All log output goes to stderr so consumers can parse stdout
//! as-is.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tracing::{error, info};

use crate::error::{EXIT_FAILURE, EXIT_OK};

use super::common::{
    bootstrap_repository, borg_env, load_runner_config, run_borg, setup_ssh_key,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub name: String,
    pub time: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveListing {
    pub repository: String,
    pub archive_count: usize,
    pub archives: Vec<ArchiveEntry>,
}

/// Reduce borg's own `list --json` output to the consumer contract:
/// name, time, and a 12-character id prefix per archive.
pub fn simplify_listing(repository: &str, raw: &serde_json::Value) -> ArchiveListing {
    let archives: Vec<ArchiveEntry> = raw
        .get("archives")
        .and_then(|a| a.as_array())
        .map(|archives| {
            archives
                .iter()
                .filter_map(|archive| {
                    Some(ArchiveEntry {
                        name: archive.get("name")?.as_str()?.to_string(),
                        time: archive.get("time")?.as_str()?.to_string(),
                        id: archive
                            .get("id")?
                            .as_str()?
                            .chars()
                            .take(12)
                            .collect(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    ArchiveListing {
        repository: repository.to_string(),
        archive_count: archives.len(),
        archives,
    }
}

pub async fn run(config_path: &Path) -> i32 {
    match run_list(config_path).await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!("List failed: {e}");
            EXIT_FAILURE
        }
    }
}

async fn run_list(config_path: &Path) -> Result<()> {
    let config = load_runner_config(config_path)?;
    let repo = config.repo().to_string();

    let ssh_key = setup_ssh_key(config.ssh_private_key.as_deref().unwrap_or_default())?;
    let env = borg_env(&config, &ssh_key, "/cache");

    bootstrap_repository(&repo, &env).await?;

    info!(repo = %repo, "Listing archives");
    let output = run_borg(&["list", "--json", &repo], &env, Duration::from_secs(30)).await?;
    if output.code != 0 {
        anyhow::bail!("borg list failed with exit code {}: {}", output.code, output.combined);
    }

    let raw: serde_json::Value =
        serde_json::from_str(&output.stdout).context("failed to parse borg list JSON")?;

    let listing = simplify_listing(&repo, &raw);
    info!(count = listing.archive_count, "Found archives");

    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_simplify_listing() {
        let raw = json!({
            "archives": [
                {"name": "app-a-2025-01-01-00-00-05", "time": "2025-01-01T00:00:05.000000", "id": "abcdef0123456789abcdef"},
                {"name": "app-a-2025-01-02-00-00-05", "time": "2025-01-02T00:00:05.000000", "id": "1234567890abcdef123456"}
            ]
        });
        let listing = simplify_listing("repo", &raw);
        assert_eq!(listing.archive_count, 2);
        assert_eq!(listing.archives[0].id, "abcdef012345");
        assert_eq!(listing.archives[0].id.len(), 12);
        assert_eq!(listing.repository, "repo");
    }

    #[test]
    fn test_simplify_listing_empty() {
        let listing = simplify_listing("repo", &json!({}));
        assert_eq!(listing.archive_count, 0);
        assert!(listing.archives.is_empty());
    }

    #[test]
    fn test_listing_serializes_contract_fields() {
        let listing = ArchiveListing {
            repository: "repo".to_string(),
            archive_count: 1,
            archives: vec![ArchiveEntry {
                name: "n".to_string(),
                time: "t".to_string(),
                id: "abc".to_string(),
            }],
        };
        let value = serde_json::to_value(&listing).unwrap();
        assert!(value.get("repository").is_some());
        assert!(value.get("archive_count").is_some());
        assert!(value["archives"][0].get("name").is_some());
    }
}
