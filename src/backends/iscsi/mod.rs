//! Network-block export backend
//!
//! Exports logical volumes as iSCSI LUNs through the kernel target. The
//! target tree is driven directly over configfs; the persisted target
//! snapshot is a single serialized file guarded by one writer lock.

pub mod chap;
pub mod target;

pub use chap::{ChapCredentials, ChapPair};
pub use target::{IscsiTarget, LunEntry, TargetConfig};
