//! Host mount table bookkeeping
//!
//! Mounted individual volumes are recorded in the host's fstab (bind-mounted
//! into the pod) so they survive a node reboot. One line per managed device:
//! append on mount, rewrite-without-the-line on unmount. The option string is
//! fixed and dump/fsck are disabled.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use crate::error::Result;

/// Fixed mount options for managed devices
const MOUNT_OPTIONS: &str = "defaults,noatime";

/// Persistent mount table on the host
#[derive(Debug, Clone)]
pub struct MountTable {
    path: PathBuf,
}

impl MountTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Record a mounted device. Appends exactly one line.
    pub fn append(&self, device: &str, mount_point: &str, fs_type: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{device} {mount_point} {fs_type} {MOUNT_OPTIONS} 0 0")?;
        Ok(())
    }

    /// Drop every line whose device field matches. Rewrites the table.
    pub fn remove(&self, device: &str) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }

        let contents = fs::read_to_string(&self.path)?;
        let kept: Vec<&str> = contents
            .lines()
            .filter(|line| line.split_whitespace().next() != Some(device))
            .collect();

        let mut out = kept.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        fs::write(&self.path, out)?;
        Ok(())
    }

    /// Whether the table currently records the device
    pub fn contains(&self, device: &str) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        let contents = fs::read_to_string(&self.path)?;
        Ok(contents
            .lines()
            .any(|line| line.split_whitespace().next() == Some(device)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn table(dir: &tempfile::TempDir) -> MountTable {
        MountTable::new(dir.path().join("fstab"))
    }

    #[test]
    fn test_append_writes_fixed_options() {
        let dir = tempdir().unwrap();
        let table = table(&dir);

        table.append("/dev/vg0/pvc-1", "/srv/nfs/pvc-1", "xfs").unwrap();

        let contents = fs::read_to_string(dir.path().join("fstab")).unwrap();
        assert_eq!(
            contents,
            "/dev/vg0/pvc-1 /srv/nfs/pvc-1 xfs defaults,noatime 0 0\n"
        );
    }

    #[test]
    fn test_remove_drops_only_matching_device() {
        let dir = tempdir().unwrap();
        let table = table(&dir);

        table.append("/dev/vg0/a", "/mnt/a", "xfs").unwrap();
        table.append("/dev/vg0/b", "/mnt/b", "ext4").unwrap();
        table.remove("/dev/vg0/a").unwrap();

        assert!(!table.contains("/dev/vg0/a").unwrap());
        assert!(table.contains("/dev/vg0/b").unwrap());

        let contents = fs::read_to_string(dir.path().join("fstab")).unwrap();
        assert_eq!(contents, "/dev/vg0/b /mnt/b ext4 defaults,noatime 0 0\n");
    }

    #[test]
    fn test_remove_missing_table_is_noop() {
        let dir = tempdir().unwrap();
        let table = table(&dir);
        table.remove("/dev/vg0/a").unwrap();
        assert!(!table.contains("/dev/vg0/a").unwrap());
    }
}
