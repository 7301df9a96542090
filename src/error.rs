//! Fatal startup errors and process exit codes.

use thiserror::Error;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_CLUSTER_AUTH: i32 = 3;
/// Standard exit code for SIGTERM-initiated shutdown (128 + 15).
pub const EXIT_SIGTERM: i32 = 143;

/// Errors that abort a controller before any workflow runs.
///
/// Everything past startup is reported per-entry and mapped to exit 1 by
/// the workflow summary instead.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("config error: {0}")]
    Config(String),

    #[error("cluster auth error: {0}")]
    ClusterAuth(String),
}

impl FatalError {
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalError::Config(_) => EXIT_CONFIG,
            FatalError::ClusterAuth(_) => EXIT_CLUSTER_AUTH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(FatalError::Config("x".into()).exit_code(), 2);
        assert_eq!(FatalError::ClusterAuth("x".into()).exit_code(), 3);
    }
}
