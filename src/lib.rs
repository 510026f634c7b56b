//! Node Disk Provisioner
//!
//! A node-local Kubernetes storage provisioner. Each instance watches
//! cluster claim and volume objects and, on the node a claim is pinned to,
//! provisions one of three backends: an iSCSI-exported logical volume, an
//! NFS-exported logical volume, or a subdirectory of one shared NFS export.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Event Dispatch                            │
//! │        (claim / volume / storage-class watch streams)            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    Provisioning Reconciler                       │
//! │     (claim validation, node affinity, class registry/cache)      │
//! ├───────────────────┬──────────────────────┬──────────────────────┤
//! │   Block Volumes   │   iSCSI Target       │     NFS Exports      │
//! │   (LVM + fstab)   │   (configfs + CHAP)  │   (kernel exports)   │
//! ├───────────────────┴──────────────────────┴──────────────────────┤
//! │              Host Commands (lvm, mkfs, mount, exportfs)          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`provisioner`]: claim/volume lifecycle reconciler
//! - [`backends`]: LVM, iSCSI and NFS backend managers
//! - [`dispatch`]: control-plane watch streams and retry policy
//! - [`cluster`]: typed control-plane access
//! - [`host`]: privileged command execution and the host mount table
//! - [`config`]: operator configuration and annotation protocol
//! - [`error`]: error types and retry classification

pub mod backends;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod provisioner;
pub mod units;

// Re-export commonly used types
pub use backends::iscsi::{ChapCredentials, IscsiTarget, TargetConfig};
pub use backends::lvm::LvmManager;
pub use backends::nfs::NfsExports;
pub use backends::BackendKind;
pub use cluster::ClusterClient;
pub use config::{NodeIdentity, OperatorConfig};
pub use error::{Error, ErrorAction, Result};
pub use host::{CommandRunner, CommandRunnerRef, HostCommandRunner, MountTable};
pub use provisioner::{ClassRegistry, Provisioner, StorageClassParams, VolumeClaimRequest};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
