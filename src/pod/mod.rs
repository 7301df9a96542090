mod monitor;
mod supervisor;

pub use monitor::{fetch_logs, wait_pod_done, wait_pod_done_quiet, PodMonitor};
pub use supervisor::{
    backup_pod_name, build_backup_pod, build_list_pod, build_restore_pod, build_rsync_pod,
    config_secret_name,
};
