mod controller;
mod retention;

pub use controller::SnapshotWorkflow;
pub use retention::{preserved_names, SnapshotRecord};
