//! Storage backends
//!
//! Three ways a claim becomes usable storage on this node: an LVM-backed
//! block device exported as an iSCSI LUN, an LVM-backed device mounted and
//! exported over NFS, or a subdirectory of one shared NFS export.

pub mod iscsi;
pub mod lvm;
pub mod nfs;

use serde::{Deserialize, Serialize};

/// Backend type selected by a storage class `type` parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Per-volume NFS export backed by a mounted logical volume
    Nfs,
    /// Logical volume exported as an iSCSI LUN
    Iscsi,
    /// Subdirectory of the one shared NFS export
    Shared,
}

impl BackendKind {
    /// Parse a storage class `type` parameter; unknown values are None so
    /// the caller can log-and-ignore rather than fail the class.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "nfs" => Some(BackendKind::Nfs),
            "iscsi" => Some(BackendKind::Iscsi),
            "shared" => Some(BackendKind::Shared),
            _ => None,
        }
    }

    /// Whether this backend provisions a dedicated logical volume
    pub fn is_individual(&self) -> bool {
        matches!(self, BackendKind::Nfs | BackendKind::Iscsi)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Nfs => write!(f, "nfs"),
            BackendKind::Iscsi => write!(f, "iscsi"),
            BackendKind::Shared => write!(f, "shared"),
        }
    }
}
