//! Claim parsing and validation
//!
//! A `VolumeClaimRequest` is derived from the claim object once per event
//! and is immutable for the duration of that reconciliation.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use std::collections::BTreeMap;

use crate::backends::BackendKind;
use crate::config::constants;
use crate::error::{Error, Result};

/// Everything the reconciler needs from one claim event
#[derive(Debug, Clone)]
pub struct VolumeClaimRequest {
    pub claim_name: String,
    pub namespace: String,
    /// Cluster-assigned unique id; the volume name derives from it
    pub uid: String,
    pub class_name: String,
    /// Requested capacity quantity; limit takes precedence over request
    pub capacity: Option<String>,
    pub access_modes: Vec<String>,
    pub volume_mode: Option<String>,
    /// Volume object bound to the claim, once bound
    pub bound_volume: Option<String>,
    /// Node named by the node-selector annotation
    pub selected_node: Option<String>,
    pub fs_type: String,
    pub shared_path: Option<String>,
    pub mirrored: bool,
    /// Pre-existing volume named by the import annotation
    pub import_volume: Option<String>,
}

impl VolumeClaimRequest {
    /// Derive a request from the claim object.
    pub fn from_claim(claim: &PersistentVolumeClaim) -> Result<Self> {
        let meta = &claim.metadata;
        let spec = claim
            .spec
            .as_ref()
            .ok_or_else(|| Error::ClaimRejected("claim has no spec".into()))?;

        let claim_name = meta
            .name
            .clone()
            .ok_or_else(|| Error::ClaimRejected("claim has no name".into()))?;
        let uid = meta
            .uid
            .clone()
            .ok_or_else(|| Error::ClaimRejected("claim has no uid".into()))?;
        let class_name = spec
            .storage_class_name
            .clone()
            .ok_or_else(|| Error::ClaimRejected("claim names no storage class".into()))?;

        let empty = BTreeMap::new();
        let annotations = meta.annotations.as_ref().unwrap_or(&empty);

        let resources = spec.resources.as_ref();
        let capacity = resources
            .and_then(|r| r.limits.as_ref())
            .and_then(|limits| limits.get("storage"))
            .or_else(|| {
                resources
                    .and_then(|r| r.requests.as_ref())
                    .and_then(|requests| requests.get("storage"))
            })
            .map(|quantity| quantity.0.clone());

        Ok(Self {
            claim_name,
            namespace: meta.namespace.clone().unwrap_or_else(|| "default".into()),
            uid,
            class_name,
            capacity,
            access_modes: spec.access_modes.clone().unwrap_or_default(),
            volume_mode: spec.volume_mode.clone(),
            bound_volume: spec.volume_name.clone(),
            selected_node: annotations
                .get(constants::NODE_SELECTOR_ANNOTATION)
                .cloned(),
            fs_type: annotations
                .get(constants::FILESYSTEM_ANNOTATION)
                .cloned()
                .unwrap_or_else(|| constants::DEFAULT_FS_TYPE.to_string()),
            shared_path: annotations.get(constants::SHARED_PATH_ANNOTATION).cloned(),
            mirrored: annotations
                .get(constants::MIRROR_ANNOTATION)
                .map(|v| v == "true")
                .unwrap_or(false),
            import_volume: annotations.get(constants::IMPORT_ANNOTATION).cloned(),
        })
    }

    /// Deterministic volume name; retries re-target the same volume.
    pub fn pv_name(&self) -> String {
        format!("{}{}", constants::PV_NAME_PREFIX, self.uid)
    }

    /// Whether the claim asks for a many-reader or many-writer mode
    fn wants_shared_access(&self) -> Option<&String> {
        self.access_modes
            .iter()
            .find(|mode| *mode == "ReadWriteMany" || *mode == "ReadOnlyMany")
    }

    /// Enforce the request invariants for the resolved backend.
    ///
    /// Violations are permanent: the claim itself is malformed and no
    /// retry will change that.
    pub fn validate(&self, kind: BackendKind) -> Result<()> {
        if kind != BackendKind::Shared {
            if let Some(mode) = self.wants_shared_access() {
                return Err(Error::UnsupportedAccessMode { mode: mode.clone() });
            }
        }

        if self.selected_node.is_none() {
            return Err(Error::MissingAnnotation {
                key: constants::NODE_SELECTOR_ANNOTATION.to_string(),
            });
        }

        if self.capacity.is_none() {
            return Err(Error::ClaimRejected(
                "no storage capacity requested".into(),
            ));
        }

        if kind == BackendKind::Shared {
            let path = self.shared_path.as_ref().ok_or_else(|| {
                Error::MissingAnnotation {
                    key: constants::SHARED_PATH_ANNOTATION.to_string(),
                }
            })?;
            // A parent-traversal segment would escape the shared root
            if path.split('/').any(|segment| segment == "..") {
                return Err(Error::SharedPathTraversal { path: path.clone() });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaimSpec, VolumeResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn claim(annotations: &[(&str, &str)]) -> PersistentVolumeClaim {
        let mut requests = BTreeMap::new();
        requests.insert("storage".to_string(), Quantity("10Gi".to_string()));

        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data".into()),
                namespace: Some("apps".into()),
                uid: Some("abcd-1234".into()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".into()]),
                storage_class_name: Some("fast-iscsi".into()),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_from_claim_extracts_fields() {
        let request = VolumeClaimRequest::from_claim(&claim(&[
            (constants::NODE_SELECTOR_ANNOTATION, "n1"),
            (constants::FILESYSTEM_ANNOTATION, "ext4"),
            (constants::MIRROR_ANNOTATION, "true"),
        ]))
        .unwrap();

        assert_eq!(request.claim_name, "data");
        assert_eq!(request.namespace, "apps");
        assert_eq!(request.class_name, "fast-iscsi");
        assert_eq!(request.capacity.as_deref(), Some("10Gi"));
        assert_eq!(request.selected_node.as_deref(), Some("n1"));
        assert_eq!(request.fs_type, "ext4");
        assert!(request.mirrored);
        assert_eq!(request.pv_name(), "pvc-abcd-1234");
    }

    #[test]
    fn test_limit_takes_precedence_over_request() {
        let mut pvc = claim(&[(constants::NODE_SELECTOR_ANNOTATION, "n1")]);
        let mut limits = BTreeMap::new();
        limits.insert("storage".to_string(), Quantity("20Gi".to_string()));
        pvc.spec.as_mut().unwrap().resources.as_mut().unwrap().limits = Some(limits);

        let request = VolumeClaimRequest::from_claim(&pvc).unwrap();
        assert_eq!(request.capacity.as_deref(), Some("20Gi"));
    }

    #[test]
    fn test_fs_type_defaults_to_xfs() {
        let request = VolumeClaimRequest::from_claim(&claim(&[(
            constants::NODE_SELECTOR_ANNOTATION,
            "n1",
        )]))
        .unwrap();
        assert_eq!(request.fs_type, "xfs");
        assert!(!request.mirrored);
    }

    #[test]
    fn test_validate_rejects_shared_access_on_block_backend() {
        let mut pvc = claim(&[(constants::NODE_SELECTOR_ANNOTATION, "n1")]);
        pvc.spec.as_mut().unwrap().access_modes = Some(vec!["ReadWriteMany".into()]);

        let request = VolumeClaimRequest::from_claim(&pvc).unwrap();
        let err = request.validate(BackendKind::Iscsi).unwrap_err();
        assert_matches!(err, Error::UnsupportedAccessMode { .. });
        assert!(!err.is_retryable());

        // The same modes are fine on the shared backend
        let mut request = request;
        request.shared_path = Some("team-data".into());
        request.validate(BackendKind::Shared).unwrap();
    }

    #[test]
    fn test_validate_requires_node_selector() {
        let request = VolumeClaimRequest::from_claim(&claim(&[])).unwrap();
        let err = request.validate(BackendKind::Iscsi).unwrap_err();
        assert_matches!(err, Error::MissingAnnotation { .. });
    }

    #[test]
    fn test_validate_requires_capacity() {
        let mut pvc = claim(&[(constants::NODE_SELECTOR_ANNOTATION, "n1")]);
        pvc.spec.as_mut().unwrap().resources = None;

        let request = VolumeClaimRequest::from_claim(&pvc).unwrap();
        let err = request.validate(BackendKind::Iscsi).unwrap_err();
        assert_matches!(err, Error::ClaimRejected(_));
    }

    #[test]
    fn test_validate_rejects_shared_path_traversal() {
        let request = VolumeClaimRequest::from_claim(&claim(&[
            (constants::NODE_SELECTOR_ANNOTATION, "n1"),
            (constants::SHARED_PATH_ANNOTATION, "../etc"),
        ]))
        .unwrap();

        let err = request.validate(BackendKind::Shared).unwrap_err();
        assert_matches!(err, Error::SharedPathTraversal { .. });
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_validate_rejects_embedded_traversal_segment() {
        let request = VolumeClaimRequest::from_claim(&claim(&[
            (constants::NODE_SELECTOR_ANNOTATION, "n1"),
            (constants::SHARED_PATH_ANNOTATION, "team/../../etc"),
        ]))
        .unwrap();

        assert_matches!(
            request.validate(BackendKind::Shared),
            Err(Error::SharedPathTraversal { .. })
        );
    }

    #[test]
    fn test_validate_requires_shared_path_for_shared_backend() {
        let request = VolumeClaimRequest::from_claim(&claim(&[(
            constants::NODE_SELECTOR_ANNOTATION,
            "n1",
        )]))
        .unwrap();

        assert_matches!(
            request.validate(BackendKind::Shared),
            Err(Error::MissingAnnotation { .. })
        );
    }
}
