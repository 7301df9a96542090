//! Backup controller: clone the newest ready snapshot of every configured
//! PVC and run one borg worker pod per entry against the clones,
//! sequentially. Single-shot; a CronJob provides the schedule.

use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use kube_borg_backup::config;
use kube_borg_backup::error::{FatalError, EXIT_FAILURE, EXIT_SIGTERM};
use kube_borg_backup::k8s;
use kube_borg_backup::logging;
use kube_borg_backup::tracker::ResourceTracker;
use kube_borg_backup::workflow::BackupWorkflow;

#[derive(Parser)]
#[command(name = "backup-controller")]
#[command(version)]
#[command(about = "Run borg backups from PVC snapshots")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Test mode: skip worker pod spawn, still exercise clones and cleanup
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
    if let Err(e) = config::validate_for_backup(&cfg) {
        fatal(e);
    }

    let client = match k8s::init_client().await {
        Ok(client) => client,
        Err(e) => fatal(e),
    };

    let namespace = cfg.namespace.clone().unwrap_or_default();
    info!(namespace = %namespace, "Using namespace");
    if cli.test {
        info!("TEST MODE: worker pods will not be spawned");
    }

    if cfg.backups.is_empty() {
        warn!("No backups configured");
        return;
    }

    let tracker = Arc::new(ResourceTracker::new(client.clone(), &namespace));
    let workflow = match BackupWorkflow::new(client, &cfg, tracker.clone(), cli.test) {
        Ok(workflow) => workflow,
        Err(e) => fatal(e),
    };

    info!(
        count = cfg.backups.len(),
        release = cfg.release_name.as_deref().unwrap_or_default(),
        "Starting backup process"
    );

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    let failures = tokio::select! {
        failures = workflow.run(&cfg) => failures,
        _ = sigterm.recv() => {
            warn!("Received SIGTERM, cleaning up all tracked resources...");
            tracker.drain().await;
            std::process::exit(EXIT_SIGTERM);
        }
    };

    // Nothing should remain tracked after a clean run; drain as the
    // backstop and let it warn about anything left behind.
    tracker.drain().await;

    if !failures.is_empty() {
        for failure in &failures {
            error!("  - {failure}");
        }
        error!(
            "Backup process completed with errors: {}",
            failures.join("; ")
        );
        std::process::exit(EXIT_FAILURE);
    }

    info!("All backups completed successfully");
}
