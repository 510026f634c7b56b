//! Error types for the node disk provisioner
//!
//! Provides structured error types for all provisioner components including
//! claim validation, the LVM, iSCSI and NFS backends, and host command
//! execution, plus the permanent-vs-retryable classification consumed by
//! the event dispatch loop.

use thiserror::Error;

/// Unified error type for the provisioner
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Secret not found: {name} (auto-creation disabled)")]
    SecretMissing { name: String },

    // =========================================================================
    // Claim Validation Errors
    // =========================================================================
    #[error("Claim rejected: {0}")]
    ClaimRejected(String),

    #[error("Claim missing required annotation: {key}")]
    MissingAnnotation { key: String },

    #[error("Access mode {mode} is only supported by shared volumes")]
    UnsupportedAccessMode { mode: String },

    #[error("Shared storage path escapes the shared root: {path}")]
    SharedPathTraversal { path: String },

    #[error("Subsystem disabled: {0}")]
    SubsystemDisabled(String),

    #[error("Storage class not registered on this node: {name}")]
    ClassNotRegistered { name: String },

    // =========================================================================
    // Host Command Errors
    // =========================================================================
    #[error("Host command failed: {program} (exit code {code:?}): {stderr}")]
    HostCommand {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Host command output parse error: {program}: {reason}")]
    CommandOutputParse { program: String, reason: String },

    // =========================================================================
    // Volume Manager Errors
    // =========================================================================
    #[error("Logical volume not found: {pool}/{volume}")]
    VolumeNotFound { pool: String, volume: String },

    #[error("Insufficient free capacity in {pool}: requested {requested} bytes, available {available} bytes")]
    InsufficientCapacity {
        pool: String,
        requested: u64,
        available: u64,
    },

    #[error("Resize rejected: {0}")]
    ResizeRejected(String),

    #[error("Volume creation unwind failed, node left in an inconsistent state: {0}")]
    UnwindFailed(String),

    // =========================================================================
    // Export Errors
    // =========================================================================
    #[error("Export table parse error: {0}")]
    ExportTableParse(String),

    #[error("Target configuration error: {0}")]
    TargetConfig(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error at the dispatch boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Redeliver the event with exponential backoff
    Retry,
    /// Terminal failure for this event, never retried automatically
    Fail,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Malformed requests and policy violations - terminal
            Error::Configuration(_)
            | Error::ClaimRejected(_)
            | Error::MissingAnnotation { .. }
            | Error::UnsupportedAccessMode { .. }
            | Error::SharedPathTraversal { .. }
            | Error::SubsystemDisabled(_)
            | Error::ClassNotRegistered { .. }
            | Error::VolumeNotFound { .. }
            | Error::ResizeRejected(_)
            | Error::CapacityParse(_)
            | Error::SecretMissing { .. } => ErrorAction::Fail,

            // A failed unwind leaves host-side remnants in an unknown state;
            // retrying would recreate over them, so require operator action.
            Error::UnwindFailed(_) => ErrorAction::Fail,

            // An unparseable export table means the source of truth cannot
            // be trusted; surface it rather than guessing.
            Error::ExportTableParse(_) => ErrorAction::Fail,

            // Host command failures and transient control-plane errors
            _ => ErrorAction::Retry,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self.action(), ErrorAction::Retry)
    }
}

/// Result type alias for the provisioner
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_are_permanent() {
        let err = Error::MissingAnnotation {
            key: "node".into(),
        };
        assert_eq!(err.action(), ErrorAction::Fail);

        let err = Error::UnsupportedAccessMode {
            mode: "ReadWriteMany".into(),
        };
        assert_eq!(err.action(), ErrorAction::Fail);

        let err = Error::SharedPathTraversal {
            path: "../etc".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_host_failures_are_retryable() {
        let err = Error::HostCommand {
            program: "lvcreate".into(),
            code: Some(5),
            stderr: "Volume group \"vg0\" has insufficient free space".into(),
        };
        assert_eq!(err.action(), ErrorAction::Retry);

        let err = Error::InsufficientCapacity {
            pool: "vg0".into(),
            requested: 1000,
            available: 500,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_unwind_failure_escalates() {
        let err = Error::UnwindFailed("umount failed".into());
        assert_eq!(err.action(), ErrorAction::Fail);
    }
}
