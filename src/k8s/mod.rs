mod client;
mod executor;
pub mod snapshots;

pub use client::{init_client, storage_class_binding_mode, validate_storage_class};
pub use executor::{ExecOutput, PodExecutor};

/// Convert a `k8s_openapi` creation timestamp (backed by `jiff::Timestamp`)
/// into a `chrono::DateTime<Utc>` for use with the rest of the codebase.
pub fn jiff_to_chrono(ts: k8s_openapi::jiff::Timestamp) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp(ts.as_second(), ts.subsec_nanosecond() as u32)
        .unwrap_or_default()
}
