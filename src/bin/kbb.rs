//! `kbb`: the interactive restore CLI. Lists snapshots and borg archives
//! for an app and restores either into a live PVC.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kube::api::ListParams;
use kube::{Client, ResourceExt};
use tokio::signal::unix::{signal, SignalKind};
use tracing::error;

use kube_borg_backup::error::{EXIT_FAILURE, EXIT_SIGTERM};
use kube_borg_backup::k8s::{self, snapshots};
use kube_borg_backup::logging;
use kube_borg_backup::tracker::ResourceTracker;
use kube_borg_backup::workflow::{
    list_archives, load_app_config, AppConfigKind, RestoreWorkflow,
};

#[derive(Parser)]
#[command(name = "kbb")]
#[command(version)]
#[command(about = "Kubernetes Borg Backup restore CLI")]
struct Cli {
    /// Kubernetes namespace
    #[arg(short, long)]
    namespace: String,

    /// Application name
    #[arg(short, long)]
    app: String,

    /// Release name (naming prefix of the config secrets)
    #[arg(short, long)]
    release: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Snapshot operations
    Snap {
        #[command(subcommand)]
        command: SnapCommand,
    },
    /// Borg backup operations
    Backup {
        #[command(subcommand)]
        command: BackupCommand,
    },
}

#[derive(Subcommand)]
enum SnapCommand {
    /// List snapshots
    List,
    /// Restore from a snapshot
    Restore {
        /// Snapshot to restore
        snapshot_id: String,
        /// Override the target PVC name
        #[arg(long)]
        pvc: Option<String>,
    },
}

#[derive(Subcommand)]
enum BackupCommand {
    /// List borg archives
    List,
    /// Restore from an archive revision
    Restore {
        /// Archive to restore
        archive_id: String,
        /// Override the target PVC name
        #[arg(long)]
        pvc: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _ = logging::init_stdout("info");

    let client = match k8s::init_client().await {
        Ok(client) => client,
        Err(e) => {
            error!("{e}");
            std::process::exit(EXIT_FAILURE);
        }
    };

    let tracker = Arc::new(ResourceTracker::new(client.clone(), &cli.namespace));
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    let code = tokio::select! {
        result = run(&cli, client.clone(), tracker.clone()) => match result {
            Ok(()) => 0,
            Err(e) => {
                error!("{e:#}");
                EXIT_FAILURE
            }
        },
        _ = sigterm.recv() => {
            tracker.drain().await;
            EXIT_SIGTERM
        }
    };

    std::process::exit(code);
}

async fn run(cli: &Cli, client: Client, tracker: Arc<ResourceTracker>) -> Result<()> {
    match &cli.command {
        Command::Snap { command } => match command {
            SnapCommand::List => snap_list(cli, &client).await,
            SnapCommand::Restore { snapshot_id, pvc } => {
                let snapshot_config = load_app_config(
                    &client,
                    &cli.namespace,
                    &cli.release,
                    &cli.app,
                    AppConfigKind::Snapshot,
                )
                .await?;
                // The backup config supplies the clone storage class; a
                // missing secret degrades to the cluster default class.
                let borg_config = load_app_config(
                    &client,
                    &cli.namespace,
                    &cli.release,
                    &cli.app,
                    AppConfigKind::Borg,
                )
                .await
                .ok();
                let workflow =
                    RestoreWorkflow::new(client, &cli.namespace, &cli.app, tracker);
                workflow
                    .restore_snapshot(
                        &snapshot_config,
                        borg_config.as_ref(),
                        snapshot_id,
                        pvc.as_deref(),
                    )
                    .await
            }
        },
        Command::Backup { command } => match command {
            BackupCommand::List => backup_list(cli, &client, &tracker).await,
            BackupCommand::Restore { archive_id, pvc } => {
                let config = load_app_config(
                    &client,
                    &cli.namespace,
                    &cli.release,
                    &cli.app,
                    AppConfigKind::Borg,
                )
                .await?;
                let workflow =
                    RestoreWorkflow::new(client, &cli.namespace, &cli.app, tracker);
                workflow
                    .restore_archive(&config, archive_id, pvc.as_deref())
                    .await
            }
        },
    }
}

async fn snap_list(cli: &Cli, client: &Client) -> Result<()> {
    let config = load_app_config(
        client,
        &cli.namespace,
        &cli.release,
        &cli.app,
        AppConfigKind::Snapshot,
    )
    .await?;

    let pvc_names: Vec<&str> = config
        .snapshots
        .pvcs
        .iter()
        .map(|p| p.name.as_str())
        .collect();
    if pvc_names.is_empty() {
        println!("No PVCs configured for snapshot in app '{}'", cli.app);
        return Ok(());
    }

    let api = snapshots::snapshot_api(client, &cli.namespace);
    let mut matching: Vec<_> = api
        .list(&ListParams::default())
        .await
        .context("error querying VolumeSnapshots")?
        .items
        .into_iter()
        .filter(|s| {
            snapshots::source_pvc(s)
                .map(|pvc| pvc_names.contains(&pvc.as_str()))
                .unwrap_or(false)
        })
        .collect();

    if matching.is_empty() {
        println!(
            "No snapshots found for app '{}' in namespace '{}'",
            cli.app, cli.namespace
        );
        return Ok(());
    }

    matching.sort_by(|a, b| {
        let ka = a.metadata.creation_timestamp.as_ref().map(|t| k8s::jiff_to_chrono(t.0));
        let kb = b.metadata.creation_timestamp.as_ref().map(|t| k8s::jiff_to_chrono(t.0));
        kb.cmp(&ka)
    });

    println!("\nSnapshots for {} ({} found):\n", cli.app, matching.len());
    println!("{:<50} {:<30} {:<25} {:<10}", "NAME", "PVC", "CREATED", "READY");
    println!("{}", "-".repeat(120));
    for snapshot in &matching {
        let created = snapshot
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| k8s::jiff_to_chrono(t.0).to_rfc3339())
            .unwrap_or_default();
        let ready = if snapshots::is_ready(snapshot) { "Yes" } else { "No" };
        println!(
            "{:<50} {:<30} {:<25} {:<10}",
            snapshot.name_any(),
            snapshots::source_pvc(snapshot).unwrap_or_default(),
            created,
            ready
        );
    }
    println!();

    Ok(())
}

async fn backup_list(cli: &Cli, client: &Client, tracker: &ResourceTracker) -> Result<()> {
    let config = load_app_config(
        client,
        &cli.namespace,
        &cli.release,
        &cli.app,
        AppConfigKind::Borg,
    )
    .await?;

    let listing = list_archives(client, &cli.namespace, &cli.app, &config, tracker).await?;

    println!(
        "\nBorg archives for {} ({} found):",
        cli.app, listing.archive_count
    );
    println!("Repository: {}\n", listing.repository);

    if listing.archives.is_empty() {
        println!("No archives found.");
        return Ok(());
    }

    println!("{:<60} {:<25} {:<15}", "ARCHIVE", "CREATED", "ID");
    println!("{}", "-".repeat(105));
    for archive in &listing.archives {
        println!("{:<60} {:<25} {:<15}", archive.name, archive.time, archive.id);
    }
    println!();

    Ok(())
}
