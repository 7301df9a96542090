mod loader;
mod types;

pub use loader::{
    load, resolve_config_path, validate_for_backup, validate_for_snapshot, DEFAULT_CONFIG_PATH,
};
pub use types::{
    BackupEntry, Config, HookSet, ImageConfig, PodConfig, RestoreConfig, Retention, SnapshotEntry,
    SnapshotsConfig,
};
