mod backup;
mod restore;

pub use backup::BackupWorkflow;
pub use restore::{
    app_config_secret_name, extract_json_block, infer_target_pvc, list_archives, load_app_config,
    AppConfigKind, RestoreWorkflow,
};
