//! CHAP credential management
//!
//! Credentials live in a cluster Secret and are replicated to every
//! namespace the provisioner serves, so pod-side attachment code can mount
//! them wherever the claim lives. When the secret is absent and
//! auto-creation is permitted, fresh credentials are generated from the
//! OS RNG.

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::BTreeMap;
use tracing::info;

use crate::cluster::ClusterClient;
use crate::config::OperatorConfig;
use crate::error::{Error, Result};

const USERID_LEN: usize = 12;
// Some initiators cap CHAP secrets at 16 characters
const PASSWORD_LEN: usize = 16;

/// One username/password pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapPair {
    pub userid: String,
    pub password: String,
}

/// Discovery and session credentials, with an optional mutual pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapCredentials {
    pub session: ChapPair,
    pub discovery: ChapPair,
    pub mutual: Option<ChapPair>,
}

impl ChapCredentials {
    /// Generate fresh random credentials.
    pub fn generate() -> Self {
        Self {
            session: ChapPair {
                userid: random_token(USERID_LEN),
                password: random_token(PASSWORD_LEN),
            },
            discovery: ChapPair {
                userid: random_token(USERID_LEN),
                password: random_token(PASSWORD_LEN),
            },
            mutual: None,
        }
    }

    /// Decode credentials from a secret's data fields.
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let data = secret.data.as_ref().ok_or_else(|| {
            Error::Configuration("CHAP secret has no data".into())
        })?;

        let field = |key: &str| -> Result<String> {
            let bytes = data.get(key).ok_or_else(|| {
                Error::Configuration(format!("CHAP secret missing key '{key}'"))
            })?;
            String::from_utf8(bytes.0.clone()).map_err(|_| {
                Error::Configuration(format!("CHAP secret key '{key}' is not UTF-8"))
            })
        };

        let mutual = match (data.get("mutual_userid"), data.get("mutual_password")) {
            (Some(_), Some(_)) => Some(ChapPair {
                userid: field("mutual_userid")?,
                password: field("mutual_password")?,
            }),
            _ => None,
        };

        Ok(Self {
            session: ChapPair {
                userid: field("session_userid")?,
                password: field("session_password")?,
            },
            discovery: ChapPair {
                userid: field("discovery_userid")?,
                password: field("discovery_password")?,
            },
            mutual,
        })
    }

    /// Render as a secret for one namespace.
    pub fn to_secret(&self, name: &str, namespace: &str) -> Secret {
        let mut string_data = BTreeMap::new();
        string_data.insert("session_userid".to_string(), self.session.userid.clone());
        string_data.insert("session_password".to_string(), self.session.password.clone());
        string_data.insert("discovery_userid".to_string(), self.discovery.userid.clone());
        string_data.insert(
            "discovery_password".to_string(),
            self.discovery.password.clone(),
        );
        if let Some(mutual) = &self.mutual {
            string_data.insert("mutual_userid".to_string(), mutual.userid.clone());
            string_data.insert("mutual_password".to_string(), mutual.password.clone());
        }

        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            string_data: Some(string_data),
            ..Default::default()
        }
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Read CHAP credentials from the cluster, generating and replicating them
/// when permitted.
///
/// The first served namespace is authoritative. A missing secret with
/// auto-creation disabled is a permanent failure; otherwise fresh
/// credentials are generated and the secret is created/updated in every
/// served namespace.
pub async fn ensure_chap_credentials(
    cluster: &ClusterClient,
    config: &OperatorConfig,
) -> Result<ChapCredentials> {
    let secret_name = &config.chap_secret_name;
    let primary = config
        .namespaces
        .first()
        .ok_or_else(|| Error::Configuration("no namespaces configured".into()))?;

    let credentials = match cluster.get_secret(primary, secret_name).await? {
        Some(secret) => ChapCredentials::from_secret(&secret)?,
        None if config.chap_auto_create => {
            info!(
                "CHAP secret {}/{} not found, generating credentials",
                primary, secret_name
            );
            ChapCredentials::generate()
        }
        None => {
            return Err(Error::SecretMissing {
                name: format!("{primary}/{secret_name}"),
            })
        }
    };

    for namespace in &config.namespaces {
        let secret = credentials.to_secret(secret_name, namespace);
        cluster.upsert_secret(namespace, &secret).await?;
    }

    Ok(credentials)
}
