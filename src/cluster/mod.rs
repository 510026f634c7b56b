//! Control-plane access
//!
//! Thin typed wrapper over the Kubernetes API, limited to exactly the
//! object operations the provisioner needs. No status subresources, no
//! watches (the dispatch module owns those).

use k8s_openapi::api::core::v1::{ConfigMap, Node, PersistentVolume, Secret};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use tracing::debug;

use crate::error::{Error, Result};

/// Typed control-plane operations for the provisioner
#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
}

impl ClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Read one storage class.
    pub async fn get_storage_class(&self, name: &str) -> Result<StorageClass> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    /// List every storage class in the cluster.
    pub async fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    /// Create a persistent volume object.
    pub async fn create_persistent_volume(&self, pv: &PersistentVolume) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        match api.create(&PostParams::default(), pv).await {
            Ok(_) => Ok(()),
            // Retried claim events re-create the same deterministic name
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!("Persistent volume already exists, leaving it in place");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Read a persistent volume object if it exists.
    pub async fn get_persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    /// Delete a persistent volume object; absent is success.
    pub async fn delete_persistent_volume(&self, name: &str) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Names of every node currently in the cluster.
    pub async fn list_node_names(&self) -> Result<Vec<String>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes
            .items
            .into_iter()
            .filter_map(|node| node.metadata.name)
            .collect())
    }

    /// Read the operator ConfigMap.
    pub async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(|err| match err {
            kube::Error::Api(ae) if ae.code == 404 => Error::ResourceNotFound {
                kind: "ConfigMap".into(),
                name: format!("{namespace}/{name}"),
            },
            other => other.into(),
        })
    }

    /// Read a secret if it exists.
    pub async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    /// Create a secret, or replace it when it already exists.
    pub async fn upsert_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = secret
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::Internal("secret without a name".into()))?;

        match api.create(&PostParams::default(), secret).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                let mut replacement = secret.clone();
                let existing = api.get(name).await?;
                replacement.metadata.resource_version = existing.metadata.resource_version;
                api.replace(name, &PostParams::default(), &replacement).await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}
