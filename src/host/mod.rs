//! Host integration
//!
//! Everything that touches the node outside the kernel target tree goes
//! through this module: privileged command execution and the persistent
//! mount table.

pub mod cmd;
pub mod fstab;

pub use cmd::{CommandOutput, CommandRunner, CommandRunnerRef, HostCommandRunner};
pub use fstab::MountTable;
