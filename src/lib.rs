//! Kubernetes-native borg backup orchestration.
//!
//! Three single-shot workflows share this library: the snapshot controller
//! (quiesced VolumeSnapshots plus tiered pruning), the backup controller
//! (snapshot clones fed to borg worker pods), and the restore CLI. The
//! `runner` module is the worker that runs inside the ephemeral pods and
//! drives the borg process itself.

pub mod clone;
pub mod config;
pub mod error;
pub mod hooks;
pub mod k8s;
pub mod logging;
pub mod pod;
pub mod runner;
pub mod snapshot;
pub mod tracker;
pub mod workflow;

/// Label applied to every object this orchestrator creates.
pub const APP_LABEL: &str = "kube-borg-backup";
pub const MANAGED_BY: &str = "kube-borg-backup";
