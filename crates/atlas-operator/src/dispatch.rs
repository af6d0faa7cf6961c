//! Version dispatcher
//!
//! Each kind registers one `{translator, handler factory}` pair per Admin API
//! version it supports. Resolving an object picks the single populated
//! version block, resolves credentials and binds a handler to a client for
//! that version. Adding a version means registering another pair; the
//! reconciler never changes.

use crate::atlas_client::{AtlasApi, ClientFactory};
use crate::connection::ConnectionResolver;
use crate::crd::AtlasResource;
use crate::error::{OperatorError, Result, SpecVersionError};
use crate::state::StateHandler;
use crate::translate::Translator;
use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Admin API versions with a version block on the managed kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ApiVersion {
    V20231115,
    V20250312,
}

impl ApiVersion {
    pub const ALL: [ApiVersion; 2] = [ApiVersion::V20231115, ApiVersion::V20250312];

    /// Name of the version block on the spec
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiVersion::V20231115 => "v20231115",
            ApiVersion::V20250312 => "v20250312",
        }
    }

    /// Versioned media type sent in `Accept`
    pub fn media_type(&self) -> &'static str {
        match self {
            ApiVersion::V20231115 => "application/vnd.atlas.2023-11-15+json",
            ApiVersion::V20250312 => "application/vnd.atlas.2025-03-12+json",
        }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The one populated version, or why there is none
pub fn select_version(populated: &[ApiVersion]) -> Result<ApiVersion> {
    match populated {
        [] => Err(OperatorError::SpecVersion(SpecVersionError::None)),
        [version] => Ok(*version),
        _ => Err(OperatorError::SpecVersion(SpecVersionError::Multiple)),
    }
}

/// Builds the handler of one version from its client and translator
pub type HandlerFactory<K> =
    dyn Fn(Arc<dyn AtlasApi>, Arc<dyn Translator<K>>) -> Arc<dyn StateHandler<K>> + Send + Sync;

struct VersionEntry<K> {
    translator: Arc<dyn Translator<K>>,
    factory: Arc<HandlerFactory<K>>,
}

impl<K> Clone for VersionEntry<K> {
    fn clone(&self) -> Self {
        Self {
            translator: self.translator.clone(),
            factory: self.factory.clone(),
        }
    }
}

/// Versions compiled in for kind `K`
pub struct VersionRegistry<K> {
    entries: BTreeMap<ApiVersion, VersionEntry<K>>,
}

impl<K> Default for VersionRegistry<K> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K: 'static> VersionRegistry<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the translator and handler factory of one version
    pub fn register<F>(mut self, translator: Arc<dyn Translator<K>>, factory: F) -> Self
    where
        F: Fn(Arc<dyn AtlasApi>, Arc<dyn Translator<K>>) -> Arc<dyn StateHandler<K>>
            + Send
            + Sync
            + 'static,
    {
        self.entries.insert(
            translator.version(),
            VersionEntry {
                translator,
                factory: Arc::new(factory),
            },
        );
        self
    }

    pub fn versions(&self) -> Vec<ApiVersion> {
        self.entries.keys().copied().collect()
    }

    pub fn translator(&self, version: ApiVersion) -> Option<Arc<dyn Translator<K>>> {
        self.entries.get(&version).map(|e| e.translator.clone())
    }

    fn entry(&self, version: ApiVersion) -> Option<VersionEntry<K>> {
        self.entries.get(&version).cloned()
    }
}

/// Picks the handler for an object
#[async_trait]
pub trait HandlerResolver<K>: Send + Sync {
    async fn resolve(&self, obj: &K) -> Result<Arc<dyn StateHandler<K>>>;
}

/// [`HandlerResolver`] over a [`VersionRegistry`]
pub struct Dispatcher<K> {
    registry: VersionRegistry<K>,
    connection: Arc<ConnectionResolver>,
    clients: Arc<dyn ClientFactory>,
}

impl<K: AtlasResource> Dispatcher<K> {
    pub fn new(
        registry: VersionRegistry<K>,
        connection: Arc<ConnectionResolver>,
        clients: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            registry,
            connection,
            clients,
        }
    }

    pub fn registry(&self) -> &VersionRegistry<K> {
        &self.registry
    }
}

#[async_trait]
impl<K: AtlasResource> HandlerResolver<K> for Dispatcher<K> {
    #[instrument(skip(self, obj), fields(kind = %K::kind(&()), name = %obj.name_any()))]
    async fn resolve(&self, obj: &K) -> Result<Arc<dyn StateHandler<K>>> {
        let version = select_version(&obj.populated_versions())?;
        obj.validate_spec()?;

        let entry = self
            .registry
            .entry(version)
            .ok_or_else(|| OperatorError::Translation {
                kind: K::kind(&()).to_string(),
                version: version.to_string(),
            })?;

        let namespace = obj.namespace().unwrap_or_default();
        let credentials = self
            .connection
            .resolve(&namespace, obj.connection_secret_ref())
            .await?;
        let client = self
            .clients
            .client(&credentials, version, &obj.object_ref(&()))?;

        debug!(%version, credentials = %credentials.source, "Resolved handler");
        Ok((entry.factory)(client, entry.translator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas_client::testing::{FakeAtlas, FakeClientFactory};
    use crate::connection::testing::MemorySecrets;
    use crate::connection::GlobalSecretRef;
    use crate::crd::{Group, GroupSpec, GroupV20231115, GroupV20250312, LocalObjectReference};
    use crate::state::{LifecycleState, StateResult};
    use serde_json::Value;

    struct StubTranslator(ApiVersion);

    impl Translator<Group> for StubTranslator {
        fn version(&self) -> ApiVersion {
            self.0
        }

        fn to_api(&self, _obj: &Group) -> Result<Value> {
            Ok(Value::Null)
        }

        fn from_api(&self, _obj: &mut Group, _response: &Value) -> Result<()> {
            Ok(())
        }
    }

    struct StubHandler {
        version: ApiVersion,
    }

    #[async_trait]
    impl StateHandler<Group> for StubHandler {
        fn version(&self) -> ApiVersion {
            self.version
        }

        async fn handle_initial(&self, _obj: &mut Group) -> Result<StateResult> {
            Ok(StateResult::next(LifecycleState::Created, "created"))
        }

        async fn handle_import_requested(&self, _obj: &mut Group) -> Result<StateResult> {
            Ok(StateResult::unchanged(LifecycleState::ImportRequested))
        }

        async fn handle_imported(&self, _obj: &mut Group) -> Result<StateResult> {
            Ok(StateResult::unchanged(LifecycleState::Imported))
        }

        async fn handle_creating(&self, _obj: &mut Group) -> Result<StateResult> {
            Ok(StateResult::unchanged(LifecycleState::Creating))
        }

        async fn handle_created(&self, _obj: &mut Group) -> Result<StateResult> {
            Ok(StateResult::unchanged(LifecycleState::Created))
        }

        async fn handle_updating(&self, _obj: &mut Group) -> Result<StateResult> {
            Ok(StateResult::unchanged(LifecycleState::Updating))
        }

        async fn handle_updated(&self, _obj: &mut Group) -> Result<StateResult> {
            Ok(StateResult::unchanged(LifecycleState::Updated))
        }

        async fn handle_deletion_requested(&self, _obj: &mut Group) -> Result<StateResult> {
            Ok(StateResult::unchanged(LifecycleState::Deleted))
        }

        async fn handle_deleting(&self, _obj: &mut Group) -> Result<StateResult> {
            Ok(StateResult::unchanged(LifecycleState::Deleted))
        }
    }

    fn registry(versions: &[ApiVersion]) -> VersionRegistry<Group> {
        versions.iter().fold(VersionRegistry::new(), |registry, v| {
            registry.register(Arc::new(StubTranslator(*v)), |_client, translator| {
                Arc::new(StubHandler {
                    version: translator.version(),
                })
            })
        })
    }

    fn dispatcher(
        versions: &[ApiVersion],
        secrets: Arc<MemorySecrets>,
    ) -> (Dispatcher<Group>, Arc<FakeClientFactory>) {
        let clients = Arc::new(FakeClientFactory::new(Arc::new(FakeAtlas::new(
            ApiVersion::V20231115,
        ))));
        let connection = Arc::new(ConnectionResolver::new(
            secrets,
            GlobalSecretRef {
                namespace: "atlas-system".to_string(),
                name: "global-key".to_string(),
            },
        ));
        (
            Dispatcher::new(registry(versions), connection, clients.clone()),
            clients,
        )
    }

    fn group(v1: bool, v2: bool) -> Group {
        let mut group = Group::new(
            "my-group",
            GroupSpec {
                connection_secret_ref: Some(LocalObjectReference::new("creds")),
                v20231115: v1.then(|| GroupV20231115 {
                    name: "my-group".to_string(),
                    org_id: "5f1b5c4e8f1b2c3d4e5f6a7b".to_string(),
                    ..Default::default()
                }),
                v20250312: v2.then(|| GroupV20250312 {
                    name: "my-group".to_string(),
                    org_id: "5f1b5c4e8f1b2c3d4e5f6a7b".to_string(),
                    ..Default::default()
                }),
            },
        );
        group.metadata.namespace = Some("team".to_string());
        group
    }

    fn secrets() -> Arc<MemorySecrets> {
        let secrets = Arc::new(MemorySecrets::default());
        secrets.insert_credentials("team", "creds");
        secrets
    }

    #[test]
    fn test_select_version() {
        assert!(matches!(
            select_version(&[]),
            Err(OperatorError::SpecVersion(SpecVersionError::None))
        ));
        assert_eq!(
            select_version(&[ApiVersion::V20250312]).unwrap(),
            ApiVersion::V20250312
        );
        assert!(matches!(
            select_version(&ApiVersion::ALL),
            Err(OperatorError::SpecVersion(SpecVersionError::Multiple))
        ));
    }

    #[tokio::test]
    async fn test_no_client_is_built_without_exactly_one_version() {
        let (dispatcher, clients) = dispatcher(&ApiVersion::ALL, secrets());

        let err = dispatcher.resolve(&group(false, false)).await.err().unwrap();
        assert_eq!(err.ready_reason(), "NoSpecVersion");

        let err = dispatcher.resolve(&group(true, true)).await.err().unwrap();
        assert_eq!(err.ready_reason(), "MultipleSpecVersions");

        assert_eq!(clients.built(), 0);
    }

    #[tokio::test]
    async fn test_handler_is_bound_to_populated_version() {
        let (dispatcher, clients) = dispatcher(&ApiVersion::ALL, secrets());

        for _ in 0..3 {
            let handler = dispatcher.resolve(&group(true, false)).await.unwrap();
            assert_eq!(handler.version(), ApiVersion::V20231115);
        }
        let handler = dispatcher.resolve(&group(false, true)).await.unwrap();
        assert_eq!(handler.version(), ApiVersion::V20250312);

        assert_eq!(clients.built(), 4);
        assert_eq!(
            dispatcher.registry().versions(),
            vec![ApiVersion::V20231115, ApiVersion::V20250312]
        );
    }

    #[tokio::test]
    async fn test_unregistered_version_is_translation_error() {
        let (dispatcher, clients) = dispatcher(&[ApiVersion::V20231115], secrets());

        let err = dispatcher.resolve(&group(false, true)).await.err().unwrap();
        assert!(matches!(err, OperatorError::Translation { .. }));
        assert_eq!(err.to_string(), "no translator registered for Group version v20250312");
        assert_eq!(clients.built(), 0);
    }

    #[tokio::test]
    async fn test_missing_secret_builds_no_client() {
        let (dispatcher, clients) = dispatcher(&ApiVersion::ALL, Arc::new(MemorySecrets::default()));

        let err = dispatcher.resolve(&group(true, false)).await.err().unwrap();
        assert_eq!(err.to_string(), "Secret \"creds\" not found");
        assert_eq!(clients.built(), 0);
    }

    #[tokio::test]
    async fn test_invalid_spec_is_reported_before_credentials() {
        let (dispatcher, clients) = dispatcher(&ApiVersion::ALL, Arc::new(MemorySecrets::default()));

        let mut invalid = group(true, false);
        if let Some(v) = invalid.spec.v20231115.as_mut() {
            v.org_id = "nope".to_string();
        }
        let err = dispatcher.resolve(&invalid).await.err().unwrap();
        assert_eq!(err.ready_reason(), "ValidationFailed");
        assert_eq!(clients.built(), 0);
    }
}
