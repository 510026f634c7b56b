//! Claim/volume lifecycle reconciler
//!
//! One `Provisioner` instance per node owns the storage-class registry,
//! the backend managers and the control-plane client, and exposes one
//! handler per event type. Handlers return the crate error type; the
//! dispatch loop maps its permanent-vs-retryable classification onto
//! redelivery.

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use tracing::{debug, info, warn};

use crate::backends::iscsi::chap::{ensure_chap_credentials, ChapCredentials};
use crate::backends::iscsi::{IscsiTarget, TargetConfig};
use crate::backends::lvm::LvmManager;
use crate::backends::nfs::NfsExports;
use crate::backends::BackendKind;
use crate::cluster::ClusterClient;
use crate::config::{constants, OperatorConfig};
use crate::error::{Error, Result};
use crate::host::{CommandRunnerRef, MountTable};
use crate::provisioner::claim::VolumeClaimRequest;
use crate::provisioner::classes::{ClassRegistry, StorageClassParams};
use crate::provisioner::volume;
use crate::units;

/// The per-node provisioning reconciler
pub struct Provisioner {
    config: OperatorConfig,
    cluster: ClusterClient,
    classes: ClassRegistry,
    lvm: Option<LvmManager>,
    iscsi: Option<IscsiTarget>,
    nfs: NfsExports,
    chap: Option<ChapCredentials>,
}

impl Provisioner {
    pub fn new(config: OperatorConfig, cluster: ClusterClient, runner: CommandRunnerRef) -> Self {
        let mount_table = MountTable::new(constants::HOST_FSTAB_PATH);

        let lvm = config.volume_group.as_ref().map(|_| {
            LvmManager::new(
                runner.clone(),
                mount_table.clone(),
                config.destructive_actions,
            )
        });

        let iscsi = config.volume_group.as_ref().map(|_| {
            IscsiTarget::new(TargetConfig::new(
                config.iqn_for_node(&config.node.name),
                config.portal_address.clone(),
            ))
        });

        let nfs = NfsExports::new(runner, config.node.address.clone());

        Self {
            config,
            cluster,
            classes: ClassRegistry::new(),
            lvm,
            iscsi,
            nfs,
            chap: None,
        }
    }

    /// Scan storage classes and bring the enabled subsystems up. Run once
    /// before the event loop; everything here is idempotent across
    /// controller restarts.
    pub async fn startup(&mut self) -> Result<()> {
        for class in self.cluster.list_storage_classes().await? {
            self.classes.observe(&class, &self.config);
        }

        if let Some(root) = self.config.shared_root.clone() {
            info!("Starting shared volume subsystem, exporting {}", root);
            self.nfs.export(&root, &self.config.access_cidr).await?;
        } else {
            info!("Shared volume subsystem disabled");
        }

        if self.config.individual_volumes_enabled() {
            info!("Starting individual volume subsystem");
            if self.config.chap_enabled {
                self.chap = Some(ensure_chap_credentials(&self.cluster, &self.config).await?);
            }
            if let Some(iscsi) = &self.iscsi {
                iscsi.initialize(self.chap.as_ref())?;
            }
        } else {
            info!("Individual volume subsystem disabled");
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Event Handlers
    // -------------------------------------------------------------------------

    /// A storage class appeared (startup scan or creation event).
    pub fn storage_class_observed(&self, class: &StorageClass) {
        self.classes.observe(class, &self.config);
    }

    /// A claim was created: validate, provision, publish the volume.
    pub async fn claim_created(&self, claim: &PersistentVolumeClaim) -> Result<()> {
        let request = VolumeClaimRequest::from_claim(claim)?;

        if !self.classes.is_registered(&request.class_name) {
            return Err(Error::ClassNotRegistered {
                name: request.class_name,
            });
        }

        let params = self.classes.params(&request.class_name, &self.cluster).await?;
        request.validate(params.kind)?;

        let selected = request.selected_node.as_deref().unwrap_or_default();
        if selected != self.config.node.name {
            info!(
                "Claim {}/{} is for node {}, not us",
                request.namespace, request.claim_name, selected
            );
            return Ok(());
        }

        match params.kind {
            BackendKind::Shared => self.provision_shared(&request, &params).await?,
            BackendKind::Nfs => self.provision_nfs(&request, &params).await?,
            BackendKind::Iscsi => self.provision_iscsi(&request, &params).await?,
        }

        info!(
            "Provisioned {} volume for claim {}/{}",
            params.kind, request.namespace, request.claim_name
        );
        Ok(())
    }

    /// A claim changed: the only supported mutation is capacity expansion.
    pub async fn claim_updated(
        &self,
        old: &PersistentVolumeClaim,
        new: &PersistentVolumeClaim,
    ) -> Result<()> {
        let request = VolumeClaimRequest::from_claim(new)?;

        if !self.classes.is_registered(&request.class_name) {
            return Err(Error::ClassNotRegistered {
                name: request.class_name,
            });
        }

        let params = self.classes.params(&request.class_name, &self.cluster).await?;
        request.validate(params.kind)?;

        if request.selected_node.as_deref() != Some(self.config.node.name.as_str()) {
            return Ok(());
        }

        let old_request = VolumeClaimRequest::from_claim(old)?;
        let (Some(old_capacity), Some(new_capacity)) =
            (old_request.capacity.clone(), request.capacity.clone())
        else {
            return Ok(());
        };

        let old_bytes = units::parse_quantity(&old_capacity)?;
        let new_bytes = units::parse_quantity(&new_capacity)?;
        if new_bytes == old_bytes {
            return Ok(());
        }
        if new_bytes < old_bytes {
            return Err(Error::ResizeRejected(format!(
                "claim {}/{} requested a shrink ({} -> {})",
                request.namespace, request.claim_name, old_capacity, new_capacity
            )));
        }
        if !params.allow_expansion {
            return Err(Error::ResizeRejected(format!(
                "storage class {} does not allow expansion",
                request.class_name
            )));
        }
        if params.kind == BackendKind::Shared {
            return Err(Error::ResizeRejected(
                "shared volumes cannot be resized".into(),
            ));
        }

        let pool = self.volume_group()?;
        let lvm = self.lvm_manager()?;
        let lv_name = self.backing_volume_name(&request.pv_name()).await?;
        lvm.resize(pool, &lv_name, &old_capacity, &new_capacity).await?;

        info!(
            "Expanded volume for claim {}/{} to {}",
            request.namespace, request.claim_name, new_capacity
        );
        Ok(())
    }

    /// A claim was deleted: honor the reclaim policy.
    pub async fn claim_deleted(&self, claim: &PersistentVolumeClaim) -> Result<()> {
        let request = VolumeClaimRequest::from_claim(claim)?;

        if !self.classes.is_registered(&request.class_name) {
            return Ok(());
        }

        let params = self.classes.params(&request.class_name, &self.cluster).await?;
        if params.retains_volumes() {
            info!(
                "Retaining volume after deletion of claim {}/{}",
                request.namespace, request.claim_name
            );
            return Ok(());
        }

        let volume_name = request
            .bound_volume
            .clone()
            .unwrap_or_else(|| request.pv_name());
        info!(
            "Deleting volume {} after deletion of claim {}/{}",
            volume_name, request.namespace, request.claim_name
        );
        self.cluster.delete_persistent_volume(&volume_name).await
    }

    /// A volume object was deleted: tear down the node-local state.
    pub async fn volume_deleted(&self, pv: &PersistentVolume) -> Result<()> {
        let Some(pv_name) = pv.metadata.name.as_deref() else {
            return Ok(());
        };
        let Some(params) = self.managed_volume_params(pv).await? else {
            return Ok(());
        };

        match params.kind {
            // The shared directory holds data other claims may reference
            BackendKind::Shared => {
                debug!("Volume {} is shared, directory is retained", pv_name);
                return Ok(());
            }
            BackendKind::Nfs => {
                let pool = self.volume_group()?;
                let lvm = self.lvm_manager()?;
                let lv_name = volume::backing_volume(pv).unwrap_or_else(|| pv_name.to_string());
                let mount_point = mount_point_for(pv_name);

                if let Err(err) = self.nfs.unexport(&mount_point, &self.config.access_cidr).await {
                    warn!("Unexport of {} failed (continuing): {}", mount_point, err);
                }
                lvm.unmount(&mount_point, pool, &lv_name).await;
                lvm.delete(pool, &lv_name).await?;
            }
            BackendKind::Iscsi => {
                let pool = self.volume_group()?;
                let lvm = self.lvm_manager()?;
                let iscsi = self.iscsi_target()?;
                let lv_name = volume::backing_volume(pv).unwrap_or_else(|| pv_name.to_string());

                if let Err(err) = iscsi.unexport(pool, &lv_name) {
                    warn!("Unexport of {} failed (continuing): {}", lv_name, err);
                }
                lvm.delete(pool, &lv_name).await?;
            }
        }

        info!("Tore down volume {}", pv_name);
        Ok(())
    }

    /// A volume was seen on controller restart: re-establish its export
    /// without disturbing running workloads.
    pub async fn volume_resumed(&self, pv: &PersistentVolume) -> Result<()> {
        let Some(pv_name) = pv.metadata.name.as_deref() else {
            return Ok(());
        };
        let Some(params) = self.managed_volume_params(pv).await? else {
            return Ok(());
        };

        match params.kind {
            // The shared root export is re-established at startup
            BackendKind::Shared => return Ok(()),
            BackendKind::Nfs => {
                let mount_point = mount_point_for(pv_name);
                self.nfs.export(&mount_point, &self.config.access_cidr).await?;
            }
            BackendKind::Iscsi => {
                let pool = self.volume_group()?;
                let iscsi = self.iscsi_target()?;
                let lv_name = volume::backing_volume(pv).unwrap_or_else(|| pv_name.to_string());

                // The published LUN index is authoritative: clients resolved
                // it from the volume object, so the live table must match.
                let desired = volume::iscsi_lun(pv);
                let lun = iscsi.allocate_lun(pool, &lv_name, desired)?;
                let initiators = self.initiator_iqns().await?;
                iscsi.export_to_initiators(&initiators, lun, self.chap.as_ref())?;
            }
        }

        info!("Re-registered existing volume {}", pv_name);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Provisioning Paths
    // -------------------------------------------------------------------------

    async fn provision_shared(
        &self,
        request: &VolumeClaimRequest,
        params: &StorageClassParams,
    ) -> Result<()> {
        let root = self.config.shared_root.as_deref().ok_or_else(|| {
            Error::SubsystemDisabled("shared volumes are not configured".into())
        })?;
        let path = request.shared_path.as_deref().ok_or_else(|| {
            Error::MissingAnnotation {
                key: constants::SHARED_PATH_ANNOTATION.to_string(),
            }
        })?;

        let directory = format!("{root}/{path}");
        tokio::fs::create_dir_all(&directory).await?;

        let pv = volume::nfs_volume(
            request,
            params,
            &self.config.node.name,
            &self.config.node.address,
            &directory,
            None,
        );
        self.cluster.create_persistent_volume(&pv).await
    }

    async fn provision_nfs(
        &self,
        request: &VolumeClaimRequest,
        params: &StorageClassParams,
    ) -> Result<()> {
        let pool = self.volume_group()?;
        let lvm = self.lvm_manager()?;

        let pv_name = request.pv_name();
        let mount_point = mount_point_for(&pv_name);
        let lv_name = self
            .provide_block_volume(request, lvm, pool, &pv_name, Some(&mount_point))
            .await?
            .0;

        self.nfs.export(&mount_point, &self.config.access_cidr).await?;

        let pv = volume::nfs_volume(
            request,
            params,
            &self.config.node.name,
            &self.config.node.address,
            &mount_point,
            Some(&lv_name),
        );
        self.cluster.create_persistent_volume(&pv).await
    }

    async fn provision_iscsi(
        &self,
        request: &VolumeClaimRequest,
        params: &StorageClassParams,
    ) -> Result<()> {
        let pool = self.volume_group()?;
        let lvm = self.lvm_manager()?;
        let iscsi = self.iscsi_target()?;

        let pv_name = request.pv_name();
        let (lv_name, fs_type) = self
            .provide_block_volume(request, lvm, pool, &pv_name, None)
            .await?;

        let lun = iscsi.allocate_lun(pool, &lv_name, None)?;
        let initiators = self.initiator_iqns().await?;
        iscsi.export_to_initiators(&initiators, lun, self.chap.as_ref())?;

        let chap_secret = self
            .chap
            .as_ref()
            .map(|_| (self.config.chap_secret_name.as_str(), request.namespace.as_str()));
        let pv = volume::iscsi_volume(
            request,
            params,
            &self.config.node.name,
            &self.config.portal_address,
            &self.config.iqn_for_node(&self.config.node.name),
            lun,
            &fs_type,
            chap_secret,
            Some(&lv_name),
        );
        self.cluster.create_persistent_volume(&pv).await
    }

    /// Create the backing logical volume, or adopt an existing one in
    /// import mode. Returns its name and filesystem type.
    async fn provide_block_volume(
        &self,
        request: &VolumeClaimRequest,
        lvm: &LvmManager,
        pool: &str,
        pv_name: &str,
        mount_point: Option<&str>,
    ) -> Result<(String, String)> {
        if self.config.import_mode {
            let lv_name = request.import_volume.clone().ok_or_else(|| {
                Error::MissingAnnotation {
                    key: constants::IMPORT_ANNOTATION.to_string(),
                }
            })?;
            let fs_type = lvm.import(pool, &lv_name, mount_point).await?;
            Ok((lv_name, fs_type))
        } else {
            let capacity = request.capacity.as_deref().ok_or_else(|| {
                Error::ClaimRejected("no storage capacity requested".into())
            })?;
            lvm.create(
                pool,
                pv_name,
                &request.fs_type,
                capacity,
                request.mirrored,
                mount_point,
            )
            .await?;
            Ok((pv_name.to_string(), request.fs_type.clone()))
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Class parameters for a volume we manage on this node; None when the
    /// volume belongs to someone else (class or node mismatch).
    async fn managed_volume_params(
        &self,
        pv: &PersistentVolume,
    ) -> Result<Option<std::sync::Arc<StorageClassParams>>> {
        let Some(class_name) = volume::storage_class(pv) else {
            return Ok(None);
        };
        if !self.classes.is_registered(class_name) {
            debug!(
                "Volume {:?} is not ours (class {} unregistered)",
                pv.metadata.name, class_name
            );
            return Ok(None);
        }
        if volume::served_by(pv) != Some(self.config.node.name.as_str()) {
            debug!(
                "Volume {:?} is served by a different node",
                pv.metadata.name
            );
            return Ok(None);
        }
        self.classes.params(class_name, &self.cluster).await.map(Some)
    }

    /// Backing LV name recorded on the published volume, falling back to
    /// the deterministic name when the volume is not readable.
    async fn backing_volume_name(&self, pv_name: &str) -> Result<String> {
        Ok(self
            .cluster
            .get_persistent_volume(pv_name)
            .await?
            .and_then(|pv| volume::backing_volume(&pv))
            .unwrap_or_else(|| pv_name.to_string()))
    }

    /// Initiator identities for every node currently in the cluster
    async fn initiator_iqns(&self) -> Result<Vec<String>> {
        Ok(self
            .cluster
            .list_node_names()
            .await?
            .iter()
            .map(|node| self.config.iqn_for_node(node))
            .collect())
    }

    fn volume_group(&self) -> Result<&str> {
        self.config.volume_group.as_deref().ok_or_else(|| {
            Error::SubsystemDisabled("individual volumes are not configured".into())
        })
    }

    fn lvm_manager(&self) -> Result<&LvmManager> {
        self.lvm.as_ref().ok_or_else(|| {
            Error::SubsystemDisabled("individual volumes are not configured".into())
        })
    }

    fn iscsi_target(&self) -> Result<&IscsiTarget> {
        self.iscsi.as_ref().ok_or_else(|| {
            Error::SubsystemDisabled("individual volumes are not configured".into())
        })
    }

    /// The provisioner this instance answers for
    pub fn provisioner_name(&self) -> &str {
        &self.config.provisioner_name
    }
}

fn mount_point_for(pv_name: &str) -> String {
    format!("{}/{}", constants::NFS_EXPORT_ROOT, pv_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_point_derivation() {
        assert_eq!(mount_point_for("pvc-abcd"), "/srv/nfs/pvc-abcd");
    }
}
