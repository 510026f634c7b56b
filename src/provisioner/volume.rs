//! Persistent volume construction
//!
//! Builds the cluster-visible volume objects for each backend. The volume
//! carries a node-affinity annotation so teardown and resume land on the
//! node that owns the underlying storage, and a backing-volume annotation
//! so imported volumes can be torn down under their original name.

use k8s_openapi::api::core::v1::{
    ISCSIPersistentVolumeSource, NFSVolumeSource, PersistentVolume, PersistentVolumeSpec,
    SecretReference,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

use crate::config::constants;
use crate::provisioner::claim::VolumeClaimRequest;
use crate::provisioner::classes::StorageClassParams;

fn volume_metadata(
    request: &VolumeClaimRequest,
    node_name: &str,
    backing_volume: Option<&str>,
) -> ObjectMeta {
    let mut labels = BTreeMap::new();
    let (key, value) = constants::MANAGED_BY_LABEL;
    labels.insert(key.to_string(), value.to_string());
    labels.insert("app.kubernetes.io/component".to_string(), "storage".to_string());

    let mut annotations = BTreeMap::new();
    annotations.insert(
        constants::PV_NODE_ANNOTATION.to_string(),
        node_name.to_string(),
    );
    if let Some(backing) = backing_volume {
        annotations.insert(
            constants::PV_VOLUME_ANNOTATION.to_string(),
            backing.to_string(),
        );
    }

    ObjectMeta {
        name: Some(request.pv_name()),
        labels: Some(labels),
        annotations: Some(annotations),
        ..Default::default()
    }
}

fn volume_spec(request: &VolumeClaimRequest, params: &StorageClassParams) -> PersistentVolumeSpec {
    let mut capacity = BTreeMap::new();
    if let Some(storage) = &request.capacity {
        capacity.insert("storage".to_string(), Quantity(storage.clone()));
    }

    PersistentVolumeSpec {
        access_modes: Some(request.access_modes.clone()),
        capacity: Some(capacity),
        storage_class_name: Some(request.class_name.clone()),
        volume_mode: request.volume_mode.clone(),
        mount_options: if params.mount_options.is_empty() {
            None
        } else {
            Some(params.mount_options.clone())
        },
        ..Default::default()
    }
}

/// Volume object for an NFS-exported path (per-volume or shared subpath).
pub fn nfs_volume(
    request: &VolumeClaimRequest,
    params: &StorageClassParams,
    node_name: &str,
    server: &str,
    path: &str,
    backing_volume: Option<&str>,
) -> PersistentVolume {
    let mut spec = volume_spec(request, params);
    spec.nfs = Some(NFSVolumeSource {
        server: server.to_string(),
        path: path.to_string(),
        read_only: Some(false),
    });

    PersistentVolume {
        metadata: volume_metadata(request, node_name, backing_volume),
        spec: Some(spec),
        ..Default::default()
    }
}

/// Volume object for an iSCSI LUN export.
#[allow(clippy::too_many_arguments)]
pub fn iscsi_volume(
    request: &VolumeClaimRequest,
    params: &StorageClassParams,
    node_name: &str,
    portal: &str,
    target_iqn: &str,
    lun: u32,
    fs_type: &str,
    chap_secret: Option<(&str, &str)>,
    backing_volume: Option<&str>,
) -> PersistentVolume {
    let mut spec = volume_spec(request, params);
    spec.iscsi = Some(ISCSIPersistentVolumeSource {
        target_portal: portal.to_string(),
        iqn: target_iqn.to_string(),
        lun: lun as i32,
        fs_type: Some(fs_type.to_string()),
        read_only: Some(false),
        chap_auth_discovery: chap_secret.map(|_| true),
        chap_auth_session: chap_secret.map(|_| true),
        secret_ref: chap_secret.map(|(name, namespace)| SecretReference {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
        }),
        ..Default::default()
    });

    PersistentVolume {
        metadata: volume_metadata(request, node_name, backing_volume),
        spec: Some(spec),
        ..Default::default()
    }
}

// =============================================================================
// Accessors for teardown and resume
// =============================================================================

/// Node recorded as serving this volume
pub fn served_by(pv: &PersistentVolume) -> Option<&str> {
    pv.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(constants::PV_NODE_ANNOTATION))
        .map(String::as_str)
}

/// Storage class the volume belongs to
pub fn storage_class(pv: &PersistentVolume) -> Option<&str> {
    pv.spec
        .as_ref()
        .and_then(|spec| spec.storage_class_name.as_deref())
}

/// Name of the backing logical volume: the recorded annotation when
/// present (imported volumes), the object name otherwise.
pub fn backing_volume(pv: &PersistentVolume) -> Option<String> {
    pv.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(constants::PV_VOLUME_ANNOTATION))
        .cloned()
        .or_else(|| pv.metadata.name.clone())
}

/// LUN index recorded in the volume's iSCSI connection info
pub fn iscsi_lun(pv: &PersistentVolume) -> Option<u32> {
    pv.spec
        .as_ref()
        .and_then(|spec| spec.iscsi.as_ref())
        .and_then(|iscsi| u32::try_from(iscsi.lun).ok())
}
