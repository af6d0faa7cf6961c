//! Connection resolver
//!
//! Picks the credentials secret for a resource: the secret named by its
//! `connectionSecretRef` when set, otherwise the operator-wide global secret.
//! Secret contents are kept in [`SecretString`]s and never logged or copied
//! into status.

use crate::crd::LocalObjectReference;
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;
use secrecy::SecretString;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

pub const ORG_ID_KEY: &str = "orgId";
pub const PUBLIC_KEY_KEY: &str = "publicApiKey";
pub const PRIVATE_KEY_KEY: &str = "privateApiKey";

/// Label selecting secrets the operator watches for credential changes
pub const CREDENTIALS_LABEL_KEY: &str = "atlas.mongodb.com/type";
pub const CREDENTIALS_LABEL_VALUE: &str = "credentials";

/// Read access to secrets
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Fetch a secret, `None` when it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
}

/// [`SecretSource`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeSecretSource {
    client: Client,
}

impl KubeSecretSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretSource for KubeSecretSource {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Global credentials secret configured at start-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalSecretRef {
    pub namespace: String,
    pub name: String,
}

/// Atlas API key pair with its organization
#[derive(Clone)]
pub struct Credentials {
    pub org_id: String,
    pub public_key: String,
    pub private_key: SecretString,
    /// `namespace/name` of the secret these came from
    pub source: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("org_id", &self.org_id)
            .field("public_key", &self.public_key)
            .field("private_key", &"[REDACTED]")
            .field("source", &self.source)
            .finish()
    }
}

/// Read a string field from a secret's data
pub fn secret_string(secret: &Secret, key: &str) -> Result<String> {
    let secret_name = secret.metadata.name.clone().unwrap_or_default();
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .ok_or_else(|| OperatorError::InvalidCredentials {
            secret: secret_name.clone(),
            reason: format!("missing key {}", key),
        })?;

    String::from_utf8(bytes.0.clone()).map_err(|_| OperatorError::InvalidCredentials {
        secret: secret_name,
        reason: format!("key {} is not valid UTF-8", key),
    })
}

/// Parse API credentials out of a secret
pub fn credentials_from_secret(secret: &Secret) -> Result<Credentials> {
    let org_id = secret_string(secret, ORG_ID_KEY)?;
    let public_key = secret_string(secret, PUBLIC_KEY_KEY)?;
    let private_key = secret_string(secret, PRIVATE_KEY_KEY)?;

    Ok(Credentials {
        org_id,
        public_key,
        private_key: SecretString::from(private_key),
        source: format!(
            "{}/{}",
            secret.metadata.namespace.as_deref().unwrap_or_default(),
            secret.metadata.name.as_deref().unwrap_or_default()
        ),
    })
}

/// Resolves the credentials of a resource
pub struct ConnectionResolver {
    secrets: Arc<dyn SecretSource>,
    global: GlobalSecretRef,
}

impl ConnectionResolver {
    pub fn new(secrets: Arc<dyn SecretSource>, global: GlobalSecretRef) -> Self {
        Self { secrets, global }
    }

    pub fn secrets(&self) -> &Arc<dyn SecretSource> {
        &self.secrets
    }

    /// Namespace and name of the secret to use
    pub fn select<'a>(
        &'a self,
        namespace: &'a str,
        local: Option<&'a LocalObjectReference>,
    ) -> (&'a str, &'a str) {
        match local {
            Some(reference) if !reference.name.is_empty() => (namespace, reference.name.as_str()),
            _ => (self.global.namespace.as_str(), self.global.name.as_str()),
        }
    }

    #[instrument(skip(self, local))]
    pub async fn resolve(
        &self,
        namespace: &str,
        local: Option<&LocalObjectReference>,
    ) -> Result<Credentials> {
        let (secret_ns, secret_name) = self.select(namespace, local);
        debug!(secret_namespace = secret_ns, secret = secret_name, "Resolving credentials");

        let secret = self
            .secrets
            .get_secret(secret_ns, secret_name)
            .await?
            .ok_or_else(|| OperatorError::SecretNotFound {
                name: secret_name.to_string(),
            })?;
        credentials_from_secret(&secret)
    }
}
