//! Storage class registration and parameter cache
//!
//! Classes are validated once when observed (at startup or on creation)
//! and their names registered for claim handling. Parameters are cached
//! for the process lifetime: storage classes are treated as immutable
//! after creation, so a cache entry is never invalidated, and a miss
//! falls through to a control-plane read.

use dashmap::{DashMap, DashSet};
use k8s_openapi::api::storage::v1::StorageClass;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backends::BackendKind;
use crate::cluster::ClusterClient;
use crate::config::{constants, OperatorConfig};
use crate::error::{Error, Result};

// =============================================================================
// Parameters
// =============================================================================

/// Cached per-class parameters
#[derive(Debug, Clone)]
pub struct StorageClassParams {
    /// Backend selected by the class `type` parameter
    pub kind: BackendKind,
    /// Nodes the class is restricted to (empty: any node)
    pub node_restriction: Vec<String>,
    /// Reclaim policy, `Delete` or `Retain`
    pub reclaim_policy: String,
    /// Whether claims of this class may grow
    pub allow_expansion: bool,
    /// Mount options copied onto provisioned volumes
    pub mount_options: Vec<String>,
    /// Raw class annotations
    pub annotations: BTreeMap<String, String>,
}

impl StorageClassParams {
    /// Extract parameters from a storage class object.
    pub fn from_class(class: &StorageClass) -> Result<Self> {
        let parameters = class.parameters.clone().unwrap_or_default();
        let type_param = parameters
            .get(constants::CLASS_TYPE_PARAM)
            .cloned()
            .unwrap_or_default();
        let kind = BackendKind::parse(&type_param).ok_or_else(|| {
            Error::ClaimRejected(format!("unrecognized volume type: {type_param}"))
        })?;

        let node_restriction = parameters
            .get(constants::CLASS_NODES_PARAM)
            .map(|list| {
                list.split(',')
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            kind,
            node_restriction,
            reclaim_policy: class
                .reclaim_policy
                .clone()
                .unwrap_or_else(|| "Delete".to_string()),
            allow_expansion: class.allow_volume_expansion.unwrap_or(false),
            mount_options: class.mount_options.clone().unwrap_or_default(),
            annotations: class.metadata.annotations.clone().unwrap_or_default(),
        })
    }

    /// Volumes of this class must stay after their claim is deleted
    pub fn retains_volumes(&self) -> bool {
        self.reclaim_policy.eq_ignore_ascii_case("retain")
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Registered class names plus the write-once parameter cache
#[derive(Default)]
pub struct ClassRegistry {
    registered: DashSet<String>,
    cache: DashMap<String, Arc<StorageClassParams>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a storage class against this node's configuration and
    /// register it for claim handling. Invalid classes are logged and
    /// ignored, never failed: other provisioners' classes are none of our
    /// business and a misconfigured one must not wedge the event stream.
    ///
    /// Returns whether the class was registered.
    pub fn observe(&self, class: &StorageClass, config: &OperatorConfig) -> bool {
        let Some(name) = class.metadata.name.clone() else {
            return false;
        };

        if class.provisioner != config.provisioner_name {
            debug!("Ignoring storage class {} (different provisioner)", name);
            return false;
        }

        let params = match StorageClassParams::from_class(class) {
            Ok(params) => params,
            Err(err) => {
                warn!("Ignoring storage class {}: {}", name, err);
                return false;
            }
        };

        let enabled = match params.kind {
            BackendKind::Shared => config.shared_volumes_enabled(),
            BackendKind::Nfs | BackendKind::Iscsi => config.individual_volumes_enabled(),
        };
        if !enabled {
            warn!(
                "Ignoring storage class {} for type '{}': subsystem not enabled",
                name, params.kind
            );
            return false;
        }

        if !params.node_restriction.is_empty()
            && !params.node_restriction.contains(&config.node.name)
        {
            debug!(
                "Ignoring storage class {}: restricted to nodes {:?}",
                name, params.node_restriction
            );
            return false;
        }

        if params.kind == BackendKind::Shared
            && !config.shared_nodes.is_empty()
            && !config.shared_nodes.contains(&config.node.name)
        {
            debug!(
                "Ignoring shared storage class {}: this node does not serve shared volumes",
                name
            );
            return false;
        }

        info!("Registering storage class {} ({})", name, params.kind);
        self.cache.insert(name.clone(), Arc::new(params));
        self.registered.insert(name);
        true
    }

    /// Whether claims of this class are handled on this node
    pub fn is_registered(&self, name: &str) -> bool {
        self.registered.contains(name)
    }

    /// Parameters for a class, read through to the control plane on miss.
    pub async fn params(
        &self,
        name: &str,
        cluster: &ClusterClient,
    ) -> Result<Arc<StorageClassParams>> {
        if let Some(params) = self.cache.get(name) {
            return Ok(Arc::clone(&params));
        }

        let class = cluster.get_storage_class(name).await?;
        let params = Arc::new(StorageClassParams::from_class(&class)?);
        self.cache.insert(name.to_string(), params.clone());
        Ok(params)
    }
}
