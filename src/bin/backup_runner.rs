//! `backup-runner`: the worker that runs inside the ephemeral pods.
//! Subcommands map to the three pod roles: `backup` drives `borg create`
//! against /data, `list` emits the archive listing JSON, `restore`
//! FUSE-mounts a revision and rsyncs it into /target.

use clap::{Parser, Subcommand};

use kube_borg_backup::config::resolve_config_path;
use kube_borg_backup::logging;
use kube_borg_backup::runner;

#[derive(Parser)]
#[command(name = "backup-runner")]
#[command(version)]
#[command(about = "Borg worker for kube-borg-backup pods")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a backup archive from the mounted data volume
    Backup {
        /// Path to config file
        #[arg(short, long)]
        config: Option<String>,
    },
    /// List repository archives as JSON on stdout
    List {
        /// Path to config file
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Restore an archive revision into the target volume
    Restore {
        /// Path to config file
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    // Logs go to stderr so `list` can keep stdout parseable.
    let _ = logging::init_stderr("info");

    let code = match cli.command {
        Command::Backup { config } => {
            let path = resolve_config_path(config.as_deref());
            runner::backup::run(&path).await
        }
        Command::List { config } => {
            let path = resolve_config_path(config.as_deref());
            runner::list::run(&path).await
        }
        Command::Restore { config } => {
            let path = resolve_config_path(config.as_deref());
            runner::restore::run(&path).await
        }
    };

    std::process::exit(code);
}
