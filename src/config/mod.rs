//! Provisioner configuration
//!
//! Runtime configuration comes from a ConfigMap in the operator namespace;
//! node identity comes from the environment (injected via the downward API
//! in the pod spec). Which subsystems run is derived from what the map
//! provides: a volume group enables individual (LVM-backed) volumes, a
//! shared root enables shared subpath volumes.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Annotation and naming constants shared across the provisioner
pub mod constants {
    /// Claim annotation selecting the node that will serve the volume
    pub const NODE_SELECTOR_ANNOTATION: &str = "node-disk.billyronks.io/node";

    /// Volume annotation recording which node services teardown/resume
    pub const PV_NODE_ANNOTATION: &str = "node-disk.billyronks.io/served-by";

    /// Claim annotation selecting the filesystem to format with
    pub const FILESYSTEM_ANNOTATION: &str = "node-disk.billyronks.io/filesystem";

    /// Claim annotation supplying the subpath under the shared root
    pub const SHARED_PATH_ANNOTATION: &str = "node-disk.billyronks.io/shared-path";

    /// Claim annotation requesting a two-way mirrored logical volume
    pub const MIRROR_ANNOTATION: &str = "node-disk.billyronks.io/mirrored";

    /// Claim annotation naming a pre-existing volume in import mode
    pub const IMPORT_ANNOTATION: &str = "node-disk.billyronks.io/import-volume";

    /// Volume annotation recording the backing logical volume name
    /// (differs from the volume object name for imported volumes)
    pub const PV_VOLUME_ANNOTATION: &str = "node-disk.billyronks.io/volume";

    /// Storage class parameter selecting the backend type
    pub const CLASS_TYPE_PARAM: &str = "type";

    /// Storage class parameter restricting the class to named nodes
    pub const CLASS_NODES_PARAM: &str = "nodes";

    /// Deterministic persistent volume name prefix; the claim UID follows
    pub const PV_NAME_PREFIX: &str = "pvc-";

    /// IQN prefix for targets and initiators; the node name follows
    pub const IQN_PREFIX: &str = "iqn.2024-01.io.billyronks.disks";

    /// Default filesystem when the claim does not select one
    pub const DEFAULT_FS_TYPE: &str = "xfs";

    /// Labels stamped on every managed persistent volume
    pub const MANAGED_BY_LABEL: (&str, &str) = ("app.kubernetes.io/managed-by", "node-disk-provisioner");

    /// Host mount table, bind-mounted into the pod
    pub const HOST_FSTAB_PATH: &str = "/host/etc/fstab";

    /// Directory individual NFS volumes are mounted under
    pub const NFS_EXPORT_ROOT: &str = "/srv/nfs";
}

// =============================================================================
// Operator Configuration
// =============================================================================

/// Node identity, resolved from the environment at startup
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    /// Kubernetes node name this instance serves
    pub name: String,
    /// Address other nodes reach this node's exports on
    pub address: String,
}

/// Configuration for one provisioner instance
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Provisioner identity matched against StorageClass.provisioner
    pub provisioner_name: String,
    /// Namespaces the provisioner serves (CHAP secret replication targets)
    pub namespaces: Vec<String>,
    /// Volume group backing individual volumes; None disables the subsystem
    pub volume_group: Option<String>,
    /// Root directory backing shared volumes; None disables the subsystem
    pub shared_root: Option<String>,
    /// Nodes allowed to serve shared volumes (empty: any)
    pub shared_nodes: Vec<String>,
    /// CIDR permitted to mount NFS exports
    pub access_cidr: String,
    /// iSCSI portal address as host:port
    pub portal_address: String,
    /// Whether CHAP authentication is applied to targets
    pub chap_enabled: bool,
    /// Secret holding CHAP credentials
    pub chap_secret_name: String,
    /// Generate CHAP credentials when the secret is absent
    pub chap_auto_create: bool,
    /// Permit irreversible deletion of underlying storage
    pub destructive_actions: bool,
    /// Match claims to pre-existing volumes instead of creating new ones
    pub import_mode: bool,
    /// Node identity
    pub node: NodeIdentity,
}

impl OperatorConfig {
    /// Build the configuration from ConfigMap data and node identity.
    pub fn from_map(data: &BTreeMap<String, String>, node: NodeIdentity) -> Result<Self> {
        let provisioner_name = data
            .get("provisioner")
            .cloned()
            .ok_or_else(|| Error::Configuration("missing 'provisioner' key".into()))?;

        let namespaces = data
            .get("namespaces")
            .map(|s| {
                s.split(',')
                    .map(|ns| ns.trim().to_string())
                    .filter(|ns| !ns.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| vec!["default".to_string()]);

        let portal_address = data
            .get("iscsi_portal")
            .cloned()
            .unwrap_or_else(|| format!("{}:3260", node.address));
        validate_portal(&portal_address)?;

        let shared_nodes = data
            .get("shared_nodes")
            .map(|s| {
                s.split(',')
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            provisioner_name,
            namespaces,
            volume_group: data.get("lvm_group").cloned(),
            shared_root: data.get("shared_root").cloned(),
            shared_nodes,
            access_cidr: data
                .get("access_cidr")
                .cloned()
                .unwrap_or_else(|| "0.0.0.0/0".to_string()),
            portal_address,
            chap_enabled: parse_bool(data, "chap_auth", false)?,
            chap_secret_name: data
                .get("chap_secret")
                .cloned()
                .unwrap_or_else(|| "node-disk-chap".to_string()),
            chap_auto_create: parse_bool(data, "chap_auto_create", true)?,
            destructive_actions: parse_bool(data, "destructive_actions", false)?,
            import_mode: parse_bool(data, "import_mode", false)?,
            node,
        })
    }

    /// Shared subpath volumes are configured
    pub fn shared_volumes_enabled(&self) -> bool {
        self.shared_root.is_some()
    }

    /// LVM-backed individual volumes are configured
    pub fn individual_volumes_enabled(&self) -> bool {
        self.volume_group.is_some()
    }

    /// The IQN of the target (and of initiators) for a given node name
    pub fn iqn_for_node(&self, node_name: &str) -> String {
        format!("{}:{}", constants::IQN_PREFIX, node_name)
    }
}

fn parse_bool(data: &BTreeMap<String, String>, key: &str, default: bool) -> Result<bool> {
    match data.get(key).map(|s| s.trim()) {
        None | Some("") => Ok(default),
        Some("true") | Some("1") | Some("yes") => Ok(true),
        Some("false") | Some("0") | Some("no") => Ok(false),
        Some(other) => Err(Error::Configuration(format!(
            "invalid boolean for '{key}': {other}"
        ))),
    }
}

fn validate_portal(portal: &str) -> Result<()> {
    let (host, port) = portal
        .rsplit_once(':')
        .ok_or_else(|| Error::Configuration(format!("portal must be host:port, got {portal}")))?;
    if host.is_empty() {
        return Err(Error::Configuration("portal host is empty".into()));
    }
    port.parse::<u16>()
        .map_err(|_| Error::Configuration(format!("invalid portal port: {port}")))?;
    Ok(())
}
