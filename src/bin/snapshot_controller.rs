//! Snapshot controller: quiesced VolumeSnapshots on a schedule, tiered
//! pruning, hook orchestration. Single-shot; a CronJob provides the
//! schedule and the outer deadline.

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use kube_borg_backup::config;
use kube_borg_backup::error::{FatalError, EXIT_FAILURE, EXIT_SIGTERM};
use kube_borg_backup::hooks::{Hook, HookEngine, HookMode};
use kube_borg_backup::k8s;
use kube_borg_backup::logging;
use kube_borg_backup::snapshot::SnapshotWorkflow;

#[derive(Parser)]
#[command(name = "snapshot-controller")]
#[command(version)]
#[command(about = "Create and prune PVC snapshots")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Test mode: skip snapshot creation, still exercise hooks
    #[arg(long)]
    test: bool,
}

fn fatal(e: FatalError) -> ! {
    error!("{e}");
    std::process::exit(e.exit_code());
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _ = logging::init_stdout("info");

    let cfg = match config::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => fatal(e),
    };
    if let Err(e) = config::validate_for_snapshot(&cfg) {
        fatal(e);
    }

    let client = match k8s::init_client().await {
        Ok(client) => client,
        Err(e) => fatal(e),
    };

    let namespace = cfg.namespace.clone().unwrap_or_default();
    info!(namespace = %namespace, "Using namespace");
    if cli.test {
        info!("TEST MODE: snapshots will not be created");
    }

    if cfg.snapshots.pvcs.is_empty() {
        warn!("No PVCs configured for snapshot");
        return;
    }

    let workflow = SnapshotWorkflow::new(client.clone(), &namespace, cli.test);

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    let failures = tokio::select! {
        failures = workflow.run(&cfg) => failures,
        _ = sigterm.recv() => {
            warn!("Received SIGTERM, running post-hooks before exit...");
            let post: Vec<Hook> = cfg
                .snapshots
                .pvcs
                .iter()
                .flat_map(|p| p.hooks.post.iter().cloned())
                .filter(|h| h.session_id.is_none())
                .collect();
            let engine = HookEngine::new(client, &namespace);
            if let Err(e) = engine.execute(&post, HookMode::Lenient).await {
                error!("Post-hooks failed during shutdown: {e}");
            }
            std::process::exit(EXIT_SIGTERM);
        }
    };

    if !failures.is_empty() {
        for failure in &failures {
            error!("  - {failure}");
        }
        error!(
            "Snapshot process completed with errors: {}",
            failures.join("; ")
        );
        std::process::exit(EXIT_FAILURE);
    }

    info!("Snapshot process completed successfully");
}
