//! Block Volume Manager
//!
//! Owns logical volume lifecycle inside the configured volume group:
//! create (with optional mirror layout, filesystem and mount), resize,
//! import of pre-existing volumes, unmount and deletion. Every mutation is
//! a sequence of host commands; each completed step pushes a compensating
//! action, and any failure runs the compensations in reverse before the
//! error is surfaced. A failed compensation escalates to a permanent error
//! because the node is left needing operator attention.

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::host::{CommandRunnerRef, MountTable};
use crate::units;

// =============================================================================
// lvs / vgs Report Parsing
// =============================================================================

#[derive(Debug, Deserialize)]
struct LvsReport {
    report: Vec<LvsReportEntry>,
}

#[derive(Debug, Deserialize)]
struct LvsReportEntry {
    #[serde(default)]
    lv: Vec<LvRecord>,
    #[serde(default)]
    vg: Vec<VgRecord>,
}

/// One logical volume row from `lvs --reportformat json`
#[derive(Debug, Clone, Deserialize)]
pub struct LvRecord {
    pub lv_name: String,
    pub vg_name: String,
    #[serde(default)]
    pub lv_size: String,
}

#[derive(Debug, Clone, Deserialize)]
struct VgRecord {
    #[serde(default)]
    vg_free: String,
}

/// Parse an lvs JSON report into its volume rows.
pub fn parse_lv_report(json: &str) -> Result<Vec<LvRecord>> {
    let report: LvsReport = serde_json::from_str(json)?;
    Ok(report
        .report
        .into_iter()
        .flat_map(|entry| entry.lv)
        .collect())
}

fn parse_vg_free(json: &str) -> Result<u64> {
    let report: LvsReport = serde_json::from_str(json)?;
    let record = report
        .report
        .into_iter()
        .flat_map(|entry| entry.vg)
        .next()
        .ok_or_else(|| Error::CommandOutputParse {
            program: "vgs".into(),
            reason: "no volume group rows in report".into(),
        })?;

    // With --units b --nosuffix the field is a byte count, possibly with
    // a decimal point.
    let trimmed = record.vg_free.trim();
    trimmed
        .parse::<u64>()
        .or_else(|_| trimmed.parse::<f64>().map(|v| v as u64))
        .map_err(|_| Error::CommandOutputParse {
            program: "vgs".into(),
            reason: format!("unparseable vg_free: {trimmed}"),
        })
}

// =============================================================================
// Compensation Stack
// =============================================================================

/// Compensating action for one completed creation step
#[derive(Debug, Clone, PartialEq, Eq)]
enum UnwindStep {
    Unmount { mount_point: String },
    RemoveMountDir { mount_point: String },
    RemoveVolume { pool: String, name: String },
}

/// Ordered list of compensations, executed in reverse on failure
#[derive(Debug, Default)]
struct UnwindStack {
    steps: Vec<UnwindStep>,
}

impl UnwindStack {
    fn push(&mut self, step: UnwindStep) {
        self.steps.push(step);
    }

    fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

// =============================================================================
// LVM Manager
// =============================================================================

/// Manages logical volumes in one volume group
pub struct LvmManager {
    runner: CommandRunnerRef,
    mount_table: MountTable,
    destructive_actions: bool,
}

impl LvmManager {
    pub fn new(
        runner: CommandRunnerRef,
        mount_table: MountTable,
        destructive_actions: bool,
    ) -> Self {
        Self {
            runner,
            mount_table,
            destructive_actions,
        }
    }

    fn device_path(pool: &str, name: &str) -> String {
        format!("/dev/{pool}/{name}")
    }

    /// Whether the volume group already holds the named volume
    pub async fn volume_exists(&self, pool: &str, name: &str) -> Result<bool> {
        let out = self.runner.run("lvs", &["--reportformat", "json"]).await?;
        let records = parse_lv_report(&out.joined())?;
        Ok(records
            .iter()
            .any(|r| r.vg_name == pool && r.lv_name == name))
    }

    /// Remaining unallocated capacity in the volume group, in bytes
    pub async fn free_capacity(&self, pool: &str) -> Result<u64> {
        let out = self
            .runner
            .run(
                "vgs",
                &[
                    pool,
                    "--reportformat",
                    "json",
                    "--units",
                    "b",
                    "--nosuffix",
                    "-o",
                    "vg_free",
                ],
            )
            .await?;
        parse_vg_free(&out.joined())
    }

    /// Create a volume, format it, and optionally mount it.
    ///
    /// A no-op when the volume already exists, so retried claim events
    /// converge without touching the device.
    pub async fn create(
        &self,
        pool: &str,
        name: &str,
        fs_type: &str,
        size: &str,
        mirrored: bool,
        mount_point: Option<&str>,
    ) -> Result<()> {
        if self.volume_exists(pool, name).await? {
            debug!("Volume {}/{} already exists, nothing to create", pool, name);
            return Ok(());
        }

        let mut unwind = UnwindStack::default();
        match self
            .create_steps(pool, name, fs_type, size, mirrored, mount_point, &mut unwind)
            .await
        {
            Ok(()) => {
                info!("Created volume {}/{} ({})", pool, name, size);
                Ok(())
            }
            Err(err) => {
                warn!(
                    "Volume creation for {}/{} failed after {} steps: {}",
                    pool,
                    name,
                    unwind.steps.len(),
                    err
                );
                self.run_unwind(unwind).await?;
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_steps(
        &self,
        pool: &str,
        name: &str,
        fs_type: &str,
        size: &str,
        mirrored: bool,
        mount_point: Option<&str>,
        unwind: &mut UnwindStack,
    ) -> Result<()> {
        let size_arg = units::lvm_size_arg(size)?;
        let device = Self::device_path(pool, name);

        let mut args = vec!["-Z", "n", "-L", size_arg.as_str(), "-n", name];
        if mirrored {
            args.extend(["--type", "raid1", "-m", "1"]);
        }
        args.push(pool);
        self.runner.run("lvcreate", &args).await?;
        unwind.push(UnwindStep::RemoveVolume {
            pool: pool.to_string(),
            name: name.to_string(),
        });

        // The device node appears asynchronously after lvcreate
        self.runner.run("udevadm", &["settle"]).await?;

        let mkfs = format!("mkfs.{fs_type}");
        self.runner.run(&mkfs, &["-f", &device]).await?;

        if let Some(mount_point) = mount_point {
            self.mount_steps(&device, mount_point, fs_type, unwind).await?;
        }

        Ok(())
    }

    async fn mount_steps(
        &self,
        device: &str,
        mount_point: &str,
        fs_type: &str,
        unwind: &mut UnwindStack,
    ) -> Result<()> {
        self.runner.run("mkdir", &["-p", mount_point]).await?;
        unwind.push(UnwindStep::RemoveMountDir {
            mount_point: mount_point.to_string(),
        });

        self.runner
            .run("mount", &["-t", fs_type, device, mount_point])
            .await?;
        unwind.push(UnwindStep::Unmount {
            mount_point: mount_point.to_string(),
        });

        self.mount_table.append(device, mount_point, fs_type)?;
        Ok(())
    }

    /// Execute compensations in reverse order. A compensation failure
    /// escalates: the node now holds remnants a retry cannot reason about.
    async fn run_unwind(&self, unwind: UnwindStack) -> Result<()> {
        if unwind.is_empty() {
            return Ok(());
        }

        for step in unwind.steps.iter().rev() {
            let result = match step {
                UnwindStep::Unmount { mount_point } => {
                    self.runner.run("umount", &[mount_point]).await.map(|_| ())
                }
                UnwindStep::RemoveMountDir { mount_point } => {
                    self.runner.run("rm", &["-rf", mount_point]).await.map(|_| ())
                }
                UnwindStep::RemoveVolume { pool, name } => {
                    if self.destructive_actions {
                        let target = format!("{pool}/{name}");
                        self.runner
                            .run("lvremove", &[target.as_str(), "--yes"])
                            .await
                            .map(|_| ())
                    } else {
                        info!(
                            "Destructive actions disabled, leaving {}/{} in place during unwind",
                            pool, name
                        );
                        Ok(())
                    }
                }
            };

            if let Err(unwind_err) = result {
                error!(
                    "Unwind step {:?} failed, disk left in an intermediate state, \
                     operator intervention required: {}",
                    step, unwind_err
                );
                return Err(Error::UnwindFailed(unwind_err.to_string()));
            }
        }
        Ok(())
    }

    /// Grow a volume and its filesystem in one operation.
    pub async fn resize(&self, pool: &str, name: &str, old_size: &str, new_size: &str) -> Result<()> {
        let old_bytes = units::parse_quantity(old_size)?;
        let new_bytes = units::parse_quantity(new_size)?;

        if new_bytes <= old_bytes {
            return Err(Error::ResizeRejected(format!(
                "volumes can only grow: {old_size} -> {new_size}"
            )));
        }

        let free = self.free_capacity(pool).await?;
        let increase = new_bytes - old_bytes;
        if increase > free {
            return Err(Error::InsufficientCapacity {
                pool: pool.to_string(),
                requested: increase,
                available: free,
            });
        }

        let size_arg = units::lvm_size_arg(new_size)?;
        let target = format!("{pool}/{name}");
        // -r extends the filesystem together with the volume
        self.runner
            .run("lvextend", &["-L", size_arg.as_str(), "-r", target.as_str()])
            .await?;

        info!("Resized volume {} to {}", target, new_size);
        Ok(())
    }

    /// Best-effort teardown of a mounted volume. Never raises: teardown
    /// must make progress on an already-partially-cleaned-up resource.
    pub async fn unmount(&self, mount_point: &str, pool: &str, name: &str) {
        if let Err(err) = self.runner.run("umount", &[mount_point]).await {
            warn!("Unmount of {} failed (continuing): {}", mount_point, err);
        }
        if let Err(err) = self.runner.run("rm", &["-rf", mount_point]).await {
            warn!(
                "Removing mount point {} failed (continuing): {}",
                mount_point, err
            );
        }
        let device = Self::device_path(pool, name);
        if let Err(err) = self.mount_table.remove(&device) {
            warn!(
                "Removing mount table entry for {} failed (continuing): {}",
                device, err
            );
        }
    }

    /// Remove the logical volume, honoring the destructive-actions gate.
    pub async fn delete(&self, pool: &str, name: &str) -> Result<()> {
        if !self.destructive_actions {
            info!(
                "Destructive actions disabled, retaining volume {}/{}",
                pool, name
            );
            return Ok(());
        }

        if !self.volume_exists(pool, name).await? {
            debug!("Volume {}/{} already gone", pool, name);
            return Ok(());
        }

        let target = format!("{pool}/{name}");
        self.runner.run("lvremove", &[target.as_str(), "--yes"]).await?;
        info!("Removed volume {}", target);
        Ok(())
    }

    /// Adopt a pre-existing volume: validate it exists, detect its
    /// filesystem, and optionally mount it with create's unwind discipline.
    /// Returns the detected filesystem type.
    pub async fn import(&self, pool: &str, name: &str, mount_point: Option<&str>) -> Result<String> {
        if !self.volume_exists(pool, name).await? {
            return Err(Error::VolumeNotFound {
                pool: pool.to_string(),
                volume: name.to_string(),
            });
        }

        let device = Self::device_path(pool, name);
        let out = self
            .runner
            .run(
                "blkid",
                &[device.as_str(), "--output", "value", "--match-tag", "TYPE"],
            )
            .await?;
        let fs_type = out
            .lines
            .first()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::CommandOutputParse {
                program: "blkid".into(),
                reason: format!("no filesystem type reported for {device}"),
            })?;

        if let Some(mount_point) = mount_point {
            let mut unwind = UnwindStack::default();
            match self.mount_steps(&device, mount_point, &fs_type, &mut unwind).await {
                Ok(()) => {}
                Err(err) => {
                    warn!("Import mount for {} failed: {}", device, err);
                    self.run_unwind(unwind).await?;
                    return Err(err);
                }
            }
        }

        info!("Imported volume {}/{} ({})", pool, name, fs_type);
        Ok(fs_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::cmd::testing::{Reply, ScriptedRunner};
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn lvs_json(volumes: &[(&str, &str)]) -> Vec<String> {
        let rows: Vec<String> = volumes
            .iter()
            .map(|(vg, lv)| {
                format!(r#"{{"lv_name":"{lv}","vg_name":"{vg}","lv_size":"10.00g"}}"#)
            })
            .collect();
        vec![format!(
            r#"{{"report":[{{"lv":[{}]}}]}}"#,
            rows.join(",")
        )]
    }

    fn vgs_json(free: &str) -> Vec<String> {
        vec![format!(r#"{{"report":[{{"vg":[{{"vg_free":"{free}"}}]}}]}}"#)]
    }

    fn manager(runner: ScriptedRunner, destructive: bool) -> (LvmManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let table = MountTable::new(dir.path().join("fstab"));
        (
            LvmManager::new(Arc::new(runner), table, destructive),
            dir,
        )
    }

    #[tokio::test]
    async fn test_create_is_noop_when_volume_exists() {
        let runner = ScriptedRunner::new().on("lvs", Reply::Lines(lvs_json(&[("vg0", "pvc-1")])));
        let handle = Arc::new(runner);
        let dir = tempdir().unwrap();
        let lvm = LvmManager::new(
            handle.clone(),
            MountTable::new(dir.path().join("fstab")),
            true,
        );

        lvm.create("vg0", "pvc-1", "xfs", "10Gi", false, None)
            .await
            .unwrap();
        assert!(handle.calls_for("lvcreate").is_empty());
    }

    #[tokio::test]
    async fn test_create_runs_full_sequence_with_mount() {
        let runner = ScriptedRunner::new().on("lvs", Reply::Lines(lvs_json(&[])));
        let handle = Arc::new(runner);
        let dir = tempdir().unwrap();
        let table = MountTable::new(dir.path().join("fstab"));
        let lvm = LvmManager::new(handle.clone(), table.clone(), true);

        lvm.create("vg0", "pvc-1", "xfs", "10Gi", false, Some("/srv/nfs/pvc-1"))
            .await
            .unwrap();

        let calls = handle.calls();
        assert_eq!(calls[1], "lvcreate -Z n -L 10g -n pvc-1 vg0");
        assert_eq!(calls[2], "udevadm settle");
        assert_eq!(calls[3], "mkfs.xfs -f /dev/vg0/pvc-1");
        assert_eq!(calls[4], "mkdir -p /srv/nfs/pvc-1");
        assert_eq!(calls[5], "mount -t xfs /dev/vg0/pvc-1 /srv/nfs/pvc-1");
        assert!(table.contains("/dev/vg0/pvc-1").unwrap());
    }

    #[tokio::test]
    async fn test_create_mirrored_layout() {
        let runner = ScriptedRunner::new().on("lvs", Reply::Lines(lvs_json(&[])));
        let handle = Arc::new(runner);
        let dir = tempdir().unwrap();
        let lvm = LvmManager::new(
            handle.clone(),
            MountTable::new(dir.path().join("fstab")),
            true,
        );

        lvm.create("vg0", "pvc-1", "xfs", "10Gi", true, None)
            .await
            .unwrap();

        assert_eq!(
            handle.calls_for("lvcreate")[0],
            "lvcreate -Z n -L 10g -n pvc-1 --type raid1 -m 1 vg0"
        );
    }

    #[tokio::test]
    async fn test_create_unwinds_in_reverse_on_mount_failure() {
        let runner = ScriptedRunner::new()
            .on("lvs", Reply::Lines(lvs_json(&[])))
            .on(
                "mount",
                Reply::Fail {
                    code: 32,
                    stderr: "mount failed".into(),
                },
            );
        let handle = Arc::new(runner);
        let dir = tempdir().unwrap();
        let lvm = LvmManager::new(
            handle.clone(),
            MountTable::new(dir.path().join("fstab")),
            true,
        );

        let err = lvm
            .create("vg0", "pvc-1", "xfs", "10Gi", false, Some("/srv/nfs/pvc-1"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        // Compensations run in reverse: the mount dir goes first, then the
        // volume (mount itself never completed, so no umount).
        let calls = handle.calls();
        let rm_idx = calls.iter().position(|c| c == "rm -rf /srv/nfs/pvc-1").unwrap();
        let lvremove_idx = calls
            .iter()
            .position(|c| c == "lvremove vg0/pvc-1 --yes")
            .unwrap();
        assert!(rm_idx < lvremove_idx);
        assert!(!calls.iter().any(|c| c.starts_with("umount")));
    }

    #[tokio::test]
    async fn test_unwind_skips_lvremove_without_destructive_actions() {
        let runner = ScriptedRunner::new()
            .on("lvs", Reply::Lines(lvs_json(&[])))
            .on(
                "mkfs.xfs",
                Reply::Fail {
                    code: 1,
                    stderr: "mkfs failed".into(),
                },
            );
        let handle = Arc::new(runner);
        let dir = tempdir().unwrap();
        let lvm = LvmManager::new(
            handle.clone(),
            MountTable::new(dir.path().join("fstab")),
            false,
        );

        let err = lvm
            .create("vg0", "pvc-1", "xfs", "10Gi", false, None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(handle.calls_for("lvremove").is_empty());
    }

    #[tokio::test]
    async fn test_failed_unwind_escalates_to_permanent() {
        let runner = ScriptedRunner::new()
            .on("lvs", Reply::Lines(lvs_json(&[])))
            .on(
                "mkfs.xfs",
                Reply::Fail {
                    code: 1,
                    stderr: "mkfs failed".into(),
                },
            )
            .on(
                "lvremove",
                Reply::Fail {
                    code: 5,
                    stderr: "device busy".into(),
                },
            );
        let (lvm, _dir) = manager(runner, true);

        let err = lvm
            .create("vg0", "pvc-1", "xfs", "10Gi", false, None)
            .await
            .unwrap_err();
        assert_matches!(err, Error::UnwindFailed(_));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_resize_rejects_shrink_without_running_commands() {
        let runner = ScriptedRunner::new();
        let handle = Arc::new(runner);
        let dir = tempdir().unwrap();
        let lvm = LvmManager::new(
            handle.clone(),
            MountTable::new(dir.path().join("fstab")),
            true,
        );

        let err = lvm.resize("vg0", "pvc-1", "10Gi", "10Gi").await.unwrap_err();
        assert_matches!(err, Error::ResizeRejected(_));
        assert!(handle.calls().is_empty());

        let err = lvm.resize("vg0", "pvc-1", "10Gi", "5Gi").await.unwrap_err();
        assert_matches!(err, Error::ResizeRejected(_));
        assert!(handle.calls().is_empty());
    }

    #[tokio::test]
    async fn test_resize_rejects_when_pool_lacks_space() {
        // 1GiB free, asking for a 5GiB increase
        let runner = ScriptedRunner::new().on("vgs", Reply::Lines(vgs_json("1073741824")));
        let handle = Arc::new(runner);
        let dir = tempdir().unwrap();
        let lvm = LvmManager::new(
            handle.clone(),
            MountTable::new(dir.path().join("fstab")),
            true,
        );

        let err = lvm.resize("vg0", "pvc-1", "10Gi", "15Gi").await.unwrap_err();
        assert_matches!(err, Error::InsufficientCapacity { .. });
        assert!(err.is_retryable());
        assert!(handle.calls_for("lvextend").is_empty());
    }

    #[tokio::test]
    async fn test_resize_extends_volume_and_filesystem() {
        let runner = ScriptedRunner::new().on("vgs", Reply::Lines(vgs_json("107374182400")));
        let handle = Arc::new(runner);
        let dir = tempdir().unwrap();
        let lvm = LvmManager::new(
            handle.clone(),
            MountTable::new(dir.path().join("fstab")),
            true,
        );

        lvm.resize("vg0", "pvc-1", "10Gi", "15Gi").await.unwrap();
        assert_eq!(
            handle.calls_for("lvextend")[0],
            "lvextend -L 15g -r vg0/pvc-1"
        );
    }

    #[tokio::test]
    async fn test_unmount_never_raises_and_clears_table() {
        let runner = ScriptedRunner::new().on(
            "umount",
            Reply::Fail {
                code: 32,
                stderr: "not mounted".into(),
            },
        );
        let dir = tempdir().unwrap();
        let table = MountTable::new(dir.path().join("fstab"));
        table.append("/dev/vg0/pvc-1", "/srv/nfs/pvc-1", "xfs").unwrap();
        let lvm = LvmManager::new(Arc::new(runner), table.clone(), true);

        lvm.unmount("/srv/nfs/pvc-1", "vg0", "pvc-1").await;
        assert!(!table.contains("/dev/vg0/pvc-1").unwrap());
    }

    #[tokio::test]
    async fn test_delete_respects_destructive_gate() {
        let runner = ScriptedRunner::new().on("lvs", Reply::Lines(lvs_json(&[("vg0", "pvc-1")])));
        let handle = Arc::new(runner);
        let dir = tempdir().unwrap();
        let lvm = LvmManager::new(
            handle.clone(),
            MountTable::new(dir.path().join("fstab")),
            false,
        );

        lvm.delete("vg0", "pvc-1").await.unwrap();
        assert!(handle.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_existing_volume() {
        let runner = ScriptedRunner::new().on("lvs", Reply::Lines(lvs_json(&[("vg0", "pvc-1")])));
        let handle = Arc::new(runner);
        let dir = tempdir().unwrap();
        let lvm = LvmManager::new(
            handle.clone(),
            MountTable::new(dir.path().join("fstab")),
            true,
        );

        lvm.delete("vg0", "pvc-1").await.unwrap();
        assert_eq!(handle.calls_for("lvremove")[0], "lvremove vg0/pvc-1 --yes");
    }

    #[tokio::test]
    async fn test_import_fails_permanently_when_volume_missing() {
        let runner = ScriptedRunner::new().on("lvs", Reply::Lines(lvs_json(&[])));
        let (lvm, _dir) = manager(runner, true);

        let err = lvm.import("vg0", "legacy-data", None).await.unwrap_err();
        assert_matches!(err, Error::VolumeNotFound { .. });
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_import_detects_filesystem_and_mounts() {
        let runner = ScriptedRunner::new()
            .on("lvs", Reply::Lines(lvs_json(&[("vg0", "legacy-data")])))
            .on("blkid", Reply::Lines(vec!["ext4".into()]));
        let handle = Arc::new(runner);
        let dir = tempdir().unwrap();
        let table = MountTable::new(dir.path().join("fstab"));
        let lvm = LvmManager::new(handle.clone(), table.clone(), true);

        let fs = lvm
            .import("vg0", "legacy-data", Some("/srv/nfs/legacy"))
            .await
            .unwrap();
        assert_eq!(fs, "ext4");
        assert_eq!(
            handle.calls_for("mount")[0],
            "mount -t ext4 /dev/vg0/legacy-data /srv/nfs/legacy"
        );
        assert!(table.contains("/dev/vg0/legacy-data").unwrap());
    }

    #[test]
    fn test_parse_lv_report_real_shape() {
        let json = r#"{"report":[{"lv":[
            {"lv_name":"pvc-abc","vg_name":"vg0","lv_size":"10.00g"},
            {"lv_name":"root","vg_name":"system","lv_size":"50.00g"}
        ]}]}"#;
        let records = parse_lv_report(json).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].lv_name, "pvc-abc");
        assert_eq!(records[0].vg_name, "vg0");
    }

    #[test]
    fn test_parse_vg_free_decimal() {
        assert_eq!(
            parse_vg_free(r#"{"report":[{"vg":[{"vg_free":"1073741824.00"}]}]}"#).unwrap(),
            1_073_741_824
        );
    }
}
