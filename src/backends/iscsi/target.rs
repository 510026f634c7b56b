//! Kernel target management over configfs
//!
//! One target, one TPG and one portal per node. LUNs are directories under
//! the TPG holding a symlink to their block backstore; initiator ACLs hold
//! one mapped-LUN directory per visible LUN. The live configfs tree is the
//! source of truth: every operation re-reads it rather than trusting a
//! cached table.

use parking_lot::Mutex;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::backends::iscsi::chap::ChapCredentials;
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the node's target
#[derive(Debug, Clone)]
pub struct TargetConfig {
    /// Target IQN for this node
    pub target_iqn: String,
    /// Portal address as host:port
    pub portal: String,
    /// Root of the kernel target configfs tree (overridable for tests)
    pub configfs_root: PathBuf,
    /// Persisted target snapshot
    pub saveconfig_path: PathBuf,
}

impl TargetConfig {
    pub fn new(target_iqn: String, portal: String) -> Self {
        Self {
            target_iqn,
            portal,
            configfs_root: PathBuf::from("/sys/kernel/config/target"),
            saveconfig_path: PathBuf::from("/etc/target/saveconfig.json"),
        }
    }
}

// =============================================================================
// Tree Entries
// =============================================================================

/// One LUN under the TPG
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LunEntry {
    pub index: u32,
    /// Backstore name, `<pool>:<volume>`
    pub backstore: String,
}

#[derive(Debug, Serialize)]
struct AclSnapshot {
    iqn: String,
    mapped_luns: Vec<u32>,
}

#[derive(Debug, Serialize)]
struct TargetSnapshot {
    target_iqn: String,
    tpg: u32,
    portal: String,
    luns: Vec<LunEntry>,
    acls: Vec<AclSnapshot>,
    saved_at: chrono::DateTime<chrono::Utc>,
}

// =============================================================================
// Target Manager
// =============================================================================

/// Manages the node's iSCSI target tree
pub struct IscsiTarget {
    config: TargetConfig,
    /// The snapshot file is one serialized file, not a transactional
    /// store; all writers go through this lock.
    save_lock: Mutex<()>,
}

impl IscsiTarget {
    pub fn new(config: TargetConfig) -> Self {
        Self {
            config,
            save_lock: Mutex::new(()),
        }
    }

    fn tpg_path(&self) -> PathBuf {
        self.config
            .configfs_root
            .join("iscsi")
            .join(&self.config.target_iqn)
            .join("tpgt_1")
    }

    fn backstore_root(&self) -> PathBuf {
        self.config.configfs_root.join("core").join("iblock_0")
    }

    fn backstore_name(pool: &str, volume: &str) -> String {
        format!("{pool}:{volume}")
    }

    /// Set up target, TPG, portal and auth attributes. Idempotent; safe to
    /// run on every startup and resume.
    pub fn initialize(&self, chap: Option<&ChapCredentials>) -> Result<()> {
        let tpg = self.tpg_path();
        fs::create_dir_all(self.backstore_root())?;
        fs::create_dir_all(tpg.join("lun"))?;
        fs::create_dir_all(tpg.join("acls"))?;
        fs::create_dir_all(tpg.join("np").join(&self.config.portal))?;
        fs::create_dir_all(tpg.join("attrib"))?;

        write_attr(&tpg.join("attrib").join("generate_node_acls"), "0")?;
        write_attr(
            &tpg.join("attrib").join("authentication"),
            if chap.is_some() { "1" } else { "0" },
        )?;

        if let Some(chap) = chap {
            let discovery = self
                .config
                .configfs_root
                .join("iscsi")
                .join("discovery_auth");
            fs::create_dir_all(&discovery)?;
            write_attr(&discovery.join("enforce_discovery_auth"), "1")?;
            write_attr(&discovery.join("userid"), &chap.discovery.userid)?;
            write_attr(&discovery.join("password"), &chap.discovery.password)?;
            if let Some(mutual) = &chap.mutual {
                write_attr(&discovery.join("userid_mutual"), &mutual.userid)?;
                write_attr(&discovery.join("password_mutual"), &mutual.password)?;
            }
        }

        write_attr(&tpg.join("enable"), "1")?;

        info!(
            "Target {} initialized on portal {}",
            self.config.target_iqn, self.config.portal
        );
        self.save_config()
    }

    // -------------------------------------------------------------------------
    // Backstores
    // -------------------------------------------------------------------------

    fn ensure_backstore(&self, pool: &str, volume: &str) -> Result<PathBuf> {
        let name = Self::backstore_name(pool, volume);
        let dir = self.backstore_root().join(&name);
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            fs::write(
                dir.join("control"),
                format!("udev_path=/dev/{pool}/{volume}"),
            )?;
            fs::write(dir.join("enable"), "1")?;
            debug!("Created backstore {}", name);
        }
        Ok(dir)
    }

    // -------------------------------------------------------------------------
    // LUN Table
    // -------------------------------------------------------------------------

    /// Read the live LUN table from the TPG.
    pub fn list_luns(&self) -> Result<Vec<LunEntry>> {
        let lun_root = self.tpg_path().join("lun");
        if !lun_root.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&lun_root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(index) = parse_lun_index(&name) else {
                continue;
            };
            if let Some(backstore) = linked_backstore(&entry.path())? {
                entries.push(LunEntry { index, backstore });
            }
        }
        entries.sort_by_key(|e| e.index);
        Ok(entries)
    }

    /// The LUN currently backing a volume, if any.
    pub fn find_lun(&self, pool: &str, volume: &str) -> Result<Option<LunEntry>> {
        let name = Self::backstore_name(pool, volume);
        Ok(self
            .list_luns()?
            .into_iter()
            .find(|entry| entry.backstore == name))
    }

    /// Allocate (or re-home) the LUN for a volume.
    ///
    /// With no desired index, an existing LUN is reused and a missing one
    /// is created at the lowest free index. With a desired index, the
    /// exported index is forced to match: an existing LUN at a different
    /// index is deleted and recreated so the live table agrees with the
    /// index recorded in the published volume object.
    pub fn allocate_lun(&self, pool: &str, volume: &str, desired: Option<u32>) -> Result<u32> {
        let backstore = self.ensure_backstore(pool, volume)?;
        let existing = self.find_lun(pool, volume)?;

        let index = match (existing, desired) {
            (Some(lun), None) => lun.index,
            (Some(lun), Some(desired)) if lun.index == desired => lun.index,
            (Some(lun), Some(desired)) => {
                info!(
                    "Re-homing LUN for {}:{} from index {} to {}",
                    pool, volume, lun.index, desired
                );
                self.delete_lun(lun.index)?;
                self.create_lun(desired, &backstore)?;
                desired
            }
            (None, desired) => {
                let index = match desired {
                    Some(index) => index,
                    None => self.lowest_free_index()?,
                };
                self.create_lun(index, &backstore)?;
                index
            }
        };

        self.save_config()?;
        Ok(index)
    }

    fn lowest_free_index(&self) -> Result<u32> {
        let taken: Vec<u32> = self.list_luns()?.iter().map(|e| e.index).collect();
        Ok((0..).find(|i| !taken.contains(i)).unwrap_or(0))
    }

    fn create_lun(&self, index: u32, backstore: &Path) -> Result<()> {
        let lun_dir = self.tpg_path().join("lun").join(format!("lun_{index}"));
        if lun_dir.exists() {
            if linked_backstore(&lun_dir)?.as_deref()
                != backstore.file_name().map(|n| n.to_string_lossy()).as_deref()
            {
                return Err(Error::TargetConfig(format!(
                    "LUN index {index} is already taken by another volume"
                )));
            }
            return Ok(());
        }

        fs::create_dir_all(&lun_dir)?;
        let link_name = backstore
            .file_name()
            .ok_or_else(|| Error::TargetConfig("backstore path without a name".into()))?;
        std::os::unix::fs::symlink(backstore, lun_dir.join(link_name))?;
        debug!("Created LUN {} -> {}", index, backstore.display());
        Ok(())
    }

    fn delete_lun(&self, index: u32) -> Result<()> {
        // Mapped LUNs hold links into the TPG LUN, drop them first
        for acl in self.list_acl_names()? {
            let mapped = self
                .tpg_path()
                .join("acls")
                .join(&acl)
                .join(format!("lun_{index}"));
            if mapped.exists() {
                remove_group(&mapped)?;
            }
        }

        let lun_dir = self.tpg_path().join("lun").join(format!("lun_{index}"));
        if lun_dir.exists() {
            remove_group(&lun_dir)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Initiator ACLs
    // -------------------------------------------------------------------------

    fn list_acl_names(&self) -> Result<Vec<String>> {
        let acl_root = self.tpg_path().join("acls");
        if !acl_root.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&acl_root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn ensure_acl(&self, initiator_iqn: &str) -> Result<PathBuf> {
        let acl = self.tpg_path().join("acls").join(initiator_iqn);
        if !acl.exists() {
            fs::create_dir_all(&acl)?;
            debug!("Created ACL for {}", initiator_iqn);
        }
        Ok(acl)
    }

    fn map_lun(&self, acl: &Path, index: u32) -> Result<()> {
        let mapped = acl.join(format!("lun_{index}"));
        if mapped.exists() {
            return Ok(());
        }
        let lun_dir = self.tpg_path().join("lun").join(format!("lun_{index}"));
        fs::create_dir_all(&mapped)?;
        std::os::unix::fs::symlink(&lun_dir, mapped.join(format!("lun_{index}")))?;
        Ok(())
    }

    fn set_acl_auth(&self, acl: &Path, chap: &ChapCredentials) -> Result<()> {
        let auth = acl.join("auth");
        fs::create_dir_all(&auth)?;
        write_attr(&auth.join("userid"), &chap.session.userid)?;
        write_attr(&auth.join("password"), &chap.session.password)?;
        if let Some(mutual) = &chap.mutual {
            write_attr(&auth.join("userid_mutual"), &mutual.userid)?;
            write_attr(&auth.join("password_mutual"), &mutual.password)?;
        }
        Ok(())
    }

    /// Map a LUN to every given initiator, creating ACLs as needed and
    /// applying CHAP credentials when authentication is enabled.
    pub fn export_to_initiators(
        &self,
        initiators: &[String],
        lun_index: u32,
        chap: Option<&ChapCredentials>,
    ) -> Result<()> {
        for initiator in initiators {
            let acl = self.ensure_acl(initiator)?;
            if let Some(chap) = chap {
                self.set_acl_auth(&acl, chap)?;
            }
            self.map_lun(&acl, lun_index)?;
        }
        self.save_config()
    }

    /// Tear down the export for a volume: unmap from every initiator,
    /// delete the LUN and its backstore. No-op when nothing is exported.
    pub fn unexport(&self, pool: &str, volume: &str) -> Result<()> {
        let Some(lun) = self.find_lun(pool, volume)? else {
            debug!("No LUN for {}:{}, nothing to unexport", pool, volume);
            return Ok(());
        };

        self.delete_lun(lun.index)?;

        let backstore = self.backstore_root().join(&lun.backstore);
        if backstore.exists() {
            remove_group(&backstore)?;
        }

        info!("Unexported {}:{} (was LUN {})", pool, volume, lun.index);
        self.save_config()
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Write the wholesale snapshot of the target tree.
    pub fn save_config(&self) -> Result<()> {
        let luns = self.list_luns()?;
        let mut acls = Vec::new();
        for name in self.list_acl_names()? {
            let acl_dir = self.tpg_path().join("acls").join(&name);
            let mut mapped = Vec::new();
            for entry in fs::read_dir(&acl_dir)? {
                let entry = entry?;
                let entry_name = entry.file_name().to_string_lossy().to_string();
                if let Some(index) = parse_lun_index(&entry_name) {
                    mapped.push(index);
                }
            }
            mapped.sort_unstable();
            acls.push(AclSnapshot {
                iqn: name,
                mapped_luns: mapped,
            });
        }

        let snapshot = TargetSnapshot {
            target_iqn: self.config.target_iqn.clone(),
            tpg: 1,
            portal: self.config.portal.clone(),
            luns,
            acls,
            saved_at: chrono::Utc::now(),
        };

        let _guard = self.save_lock.lock();
        if let Some(parent) = self.config.saveconfig_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(
            &self.config.saveconfig_path,
            serde_json::to_string_pretty(&snapshot)?,
        )?;
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn parse_lun_index(name: &str) -> Option<u32> {
    name.strip_prefix("lun_")?.parse().ok()
}

/// Name of the backstore a LUN (or mapped-LUN) directory links to
fn linked_backstore(dir: &Path) -> Result<Option<String>> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_symlink() {
            let target = fs::read_link(entry.path())?;
            return Ok(target
                .file_name()
                .map(|name| name.to_string_lossy().to_string()));
        }
    }
    Ok(None)
}

fn write_attr(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value)?;
    Ok(())
}

/// Remove a configfs group directory. configfs drops the auto-created
/// attribute files on rmdir; plain filesystems (tests) need the recursive
/// form.
fn remove_group(path: &Path) -> Result<()> {
    // Symlinks must go before the group itself either way
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_symlink() {
            fs::remove_file(entry.path())?;
        }
    }
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(_) => Ok(fs::remove_dir_all(path)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::iscsi::chap::{ChapCredentials, ChapPair};
    use assert_matches::assert_matches;
    use tempfile::tempdir;

    const IQN: &str = "iqn.2024-01.io.billyronks.disks:n1";

    fn target(dir: &tempfile::TempDir) -> IscsiTarget {
        let config = TargetConfig {
            target_iqn: IQN.to_string(),
            portal: "10.0.0.11:3260".to_string(),
            configfs_root: dir.path().join("configfs"),
            saveconfig_path: dir.path().join("etc/target/saveconfig.json"),
        };
        IscsiTarget::new(config)
    }

    fn chap() -> ChapCredentials {
        ChapCredentials {
            session: ChapPair {
                userid: "sess-user".into(),
                password: "sess-pass-123456".into(),
            },
            discovery: ChapPair {
                userid: "disc-user".into(),
                password: "disc-pass-123456".into(),
            },
            mutual: None,
        }
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let dir = tempdir().unwrap();
        let iscsi = target(&dir);

        iscsi.initialize(None).unwrap();
        iscsi.initialize(None).unwrap();

        let tpg = dir
            .path()
            .join("configfs/iscsi")
            .join(IQN)
            .join("tpgt_1");
        assert_eq!(fs::read_to_string(tpg.join("enable")).unwrap(), "1");
        assert_eq!(
            fs::read_to_string(tpg.join("attrib/authentication")).unwrap(),
            "0"
        );
        assert!(tpg.join("np/10.0.0.11:3260").exists());
    }

    #[test]
    fn test_initialize_with_chap_sets_discovery_auth() {
        let dir = tempdir().unwrap();
        let iscsi = target(&dir);

        iscsi.initialize(Some(&chap())).unwrap();

        let discovery = dir.path().join("configfs/iscsi/discovery_auth");
        assert_eq!(
            fs::read_to_string(discovery.join("userid")).unwrap(),
            "disc-user"
        );
        let tpg = dir.path().join("configfs/iscsi").join(IQN).join("tpgt_1");
        assert_eq!(
            fs::read_to_string(tpg.join("attrib/authentication")).unwrap(),
            "1"
        );
    }

    #[test]
    fn test_allocate_lun_reuses_existing() {
        let dir = tempdir().unwrap();
        let iscsi = target(&dir);
        iscsi.initialize(None).unwrap();

        let first = iscsi.allocate_lun("vg0", "pvc-1", None).unwrap();
        let second = iscsi.allocate_lun("vg0", "pvc-1", None).unwrap();
        assert_eq!(first, second);
        assert_eq!(iscsi.list_luns().unwrap().len(), 1);
    }

    #[test]
    fn test_allocate_lun_fills_lowest_free_index() {
        let dir = tempdir().unwrap();
        let iscsi = target(&dir);
        iscsi.initialize(None).unwrap();

        assert_eq!(iscsi.allocate_lun("vg0", "a", None).unwrap(), 0);
        assert_eq!(iscsi.allocate_lun("vg0", "b", None).unwrap(), 1);
        iscsi.unexport("vg0", "a").unwrap();
        assert_eq!(iscsi.allocate_lun("vg0", "c", None).unwrap(), 0);
    }

    #[test]
    fn test_allocate_lun_converges_to_desired_index() {
        let dir = tempdir().unwrap();
        let iscsi = target(&dir);
        iscsi.initialize(None).unwrap();

        // Volume lands at index 0, then a resume asks for index 3
        assert_eq!(iscsi.allocate_lun("vg0", "pvc-1", None).unwrap(), 0);
        assert_eq!(iscsi.allocate_lun("vg0", "pvc-1", Some(3)).unwrap(), 3);
        assert_eq!(
            iscsi.list_luns().unwrap(),
            vec![LunEntry {
                index: 3,
                backstore: "vg0:pvc-1".into()
            }]
        );

        // Repeated resumes are stable
        assert_eq!(iscsi.allocate_lun("vg0", "pvc-1", Some(3)).unwrap(), 3);
    }

    #[test]
    fn test_allocate_lun_rejects_stolen_index() {
        let dir = tempdir().unwrap();
        let iscsi = target(&dir);
        iscsi.initialize(None).unwrap();

        assert_eq!(iscsi.allocate_lun("vg0", "a", None).unwrap(), 0);
        let err = iscsi.allocate_lun("vg0", "b", Some(0)).unwrap_err();
        assert_matches!(err, Error::TargetConfig(_));
    }

    #[test]
    fn test_export_to_initiators_creates_acls_and_mappings() {
        let dir = tempdir().unwrap();
        let iscsi = target(&dir);
        iscsi.initialize(None).unwrap();

        let lun = iscsi.allocate_lun("vg0", "pvc-1", None).unwrap();
        let initiators = vec![
            "iqn.2024-01.io.billyronks.disks:n1".to_string(),
            "iqn.2024-01.io.billyronks.disks:n2".to_string(),
        ];
        iscsi.export_to_initiators(&initiators, lun, None).unwrap();

        // Export is idempotent
        iscsi.export_to_initiators(&initiators, lun, None).unwrap();

        let acls = dir.path().join("configfs/iscsi").join(IQN).join("tpgt_1/acls");
        for initiator in &initiators {
            assert!(acls.join(initiator).join("lun_0").exists());
        }
    }

    #[test]
    fn test_export_applies_chap_per_acl() {
        let dir = tempdir().unwrap();
        let iscsi = target(&dir);
        iscsi.initialize(Some(&chap())).unwrap();

        let lun = iscsi.allocate_lun("vg0", "pvc-1", None).unwrap();
        let initiators = vec!["iqn.2024-01.io.billyronks.disks:n2".to_string()];
        iscsi
            .export_to_initiators(&initiators, lun, Some(&chap()))
            .unwrap();

        let auth = dir
            .path()
            .join("configfs/iscsi")
            .join(IQN)
            .join("tpgt_1/acls")
            .join(&initiators[0])
            .join("auth");
        assert_eq!(fs::read_to_string(auth.join("userid")).unwrap(), "sess-user");
        assert_eq!(
            fs::read_to_string(auth.join("password")).unwrap(),
            "sess-pass-123456"
        );
    }

    #[test]
    fn test_unexport_removes_mappings_lun_and_backstore() {
        let dir = tempdir().unwrap();
        let iscsi = target(&dir);
        iscsi.initialize(None).unwrap();

        let lun = iscsi.allocate_lun("vg0", "pvc-1", None).unwrap();
        let initiators = vec!["iqn.2024-01.io.billyronks.disks:n2".to_string()];
        iscsi.export_to_initiators(&initiators, lun, None).unwrap();

        iscsi.unexport("vg0", "pvc-1").unwrap();

        assert!(iscsi.list_luns().unwrap().is_empty());
        assert!(!dir
            .path()
            .join("configfs/core/iblock_0/vg0:pvc-1")
            .exists());
        let mapped = dir
            .path()
            .join("configfs/iscsi")
            .join(IQN)
            .join("tpgt_1/acls")
            .join(&initiators[0])
            .join("lun_0");
        assert!(!mapped.exists());
    }

    #[test]
    fn test_unexport_absent_volume_is_noop() {
        let dir = tempdir().unwrap();
        let iscsi = target(&dir);
        iscsi.initialize(None).unwrap();
        iscsi.unexport("vg0", "never-existed").unwrap();
    }

    #[test]
    fn test_save_config_snapshot_reflects_tree() {
        let dir = tempdir().unwrap();
        let iscsi = target(&dir);
        iscsi.initialize(None).unwrap();

        let lun = iscsi.allocate_lun("vg0", "pvc-1", Some(2)).unwrap();
        iscsi
            .export_to_initiators(
                &["iqn.2024-01.io.billyronks.disks:n2".to_string()],
                lun,
                None,
            )
            .unwrap();

        let raw = fs::read_to_string(dir.path().join("etc/target/saveconfig.json")).unwrap();
        let snapshot: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(snapshot["target_iqn"], IQN);
        assert_eq!(snapshot["luns"][0]["index"], 2);
        assert_eq!(snapshot["luns"][0]["backstore"], "vg0:pvc-1");
        assert_eq!(snapshot["acls"][0]["mapped_luns"][0], 2);
    }
}
