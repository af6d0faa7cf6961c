//! Controller wiring
//!
//! Builds one `kube` controller per kind on top of the shared pieces:
//!
//! - a reflector per kind whose events also feed the [`ReferenceIndex`]
//! - one extra watch per referenced kind, mapped back to dependents through
//!   the [`DependentWatchRouter`]
//! - a [`Dispatcher`] resolving credentials and the version-bound handler
//! - a [`StateReconciler`] running the lifecycle pass
//!
//! Every kind runs with its own bounded worker pool; passes over different
//! objects only share the index, the secret source and the client factory.

use crate::atlas_client::{ClientFactory, HttpClientFactory};
use crate::config::OperatorConfig;
use crate::connection::{
    ConnectionResolver, KubeSecretSource, SecretSource, CREDENTIALS_LABEL_KEY,
    CREDENTIALS_LABEL_VALUE,
};
use crate::crd::{AtlasResource, DatabaseUser, Group};
use crate::database_user_controller::{self, DatabaseUserHandlerDeps};
use crate::dispatch::{Dispatcher, VersionRegistry};
use crate::dryrun::{DryRunClientFactory, KubeEventSink};
use crate::error::Result;
use crate::group_controller::{self, GroupHandlerDeps};
use crate::indexer::{ReferenceIndex, TargetKind};
use crate::protection::DeletionProtectionGuard;
use crate::reconciler::{error_policy, reconcile, StateReconciler};
use crate::watch::{referenced_kinds, DependentWatchRouter};
use futures::{Stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::core::NamespaceResourceScope;
use kube::runtime::controller::{self, Controller};
use kube::runtime::reflector::Store;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Name reported on events published by the operator
pub const CONTROLLER_NAME: &str = "atlas-operator";

/// Metrics of one controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Create metrics labelled with the reconciled kind
    pub fn new(kind: &str) -> Self {
        Self {
            reconciliations: metrics::counter!(
                "atlas_operator_reconciliations_total",
                "kind" => kind.to_string()
            ),
            errors: metrics::counter!(
                "atlas_operator_reconciliation_errors_total",
                "kind" => kind.to_string()
            ),
            duration: metrics::histogram!(
                "atlas_operator_reconciliation_duration_seconds",
                "kind" => kind.to_string()
            ),
        }
    }
}

/// Label selector of the secrets the router watches
pub fn credentials_selector() -> String {
    format!("{}={}", CREDENTIALS_LABEL_KEY, CREDENTIALS_LABEL_VALUE)
}

/// Controller of kind `K` driven by an existing reflector stream
fn stream_controller<K: AtlasResource>(
    stream: impl Stream<Item = std::result::Result<K, watcher::Error>> + Send + 'static,
    reader: Store<K>,
    concurrency: u16,
) -> Controller<K> {
    Controller::for_stream(stream, reader)
        .with_config(controller::Config::default().concurrency(concurrency))
}

/// Collaborators shared by all controllers
pub struct OperatorContext {
    pub client: Client,
    pub config: OperatorConfig,
    pub index: Arc<ReferenceIndex>,
    pub router: DependentWatchRouter,
    pub secrets: Arc<dyn SecretSource>,
    pub connection: Arc<ConnectionResolver>,
    pub clients: Arc<dyn ClientFactory>,
}

impl OperatorContext {
    pub fn new(client: Client, config: OperatorConfig) -> Result<Self> {
        let index = Arc::new(ReferenceIndex::new());
        let secrets: Arc<dyn SecretSource> = Arc::new(KubeSecretSource::new(client.clone()));
        let connection = Arc::new(ConnectionResolver::new(
            secrets.clone(),
            config.global_secret(),
        ));

        let http: Arc<dyn ClientFactory> = Arc::new(HttpClientFactory::new(config.client_config())?);
        let clients: Arc<dyn ClientFactory> = if config.dry_run {
            let sink = Arc::new(KubeEventSink::new(
                client.clone(),
                CONTROLLER_NAME,
                config.instance.clone(),
            ));
            Arc::new(DryRunClientFactory::new(http, sink))
        } else {
            http
        };

        Ok(Self {
            client,
            config,
            router: DependentWatchRouter::new(index.clone()),
            index,
            secrets,
            connection,
            clients,
        })
    }

    fn api<T>(&self) -> Api<T>
    where
        T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        match &self.config.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// Reflector-backed watch of kind `K` that keeps the index current
    fn primary_stream<K: AtlasResource>(
        &self,
    ) -> (
        Store<K>,
        impl Stream<Item = std::result::Result<K, watcher::Error>> + Send + 'static,
    ) {
        let (reader, writer) = reflector::store::<K>();
        let index = self.index.clone();
        let stream = reflector(
            writer,
            watcher(self.api::<K>(), watcher::Config::default()).default_backoff(),
        )
        .inspect_ok(move |event| index.apply_event(event))
        .applied_objects();
        (reader, stream)
    }

    /// Run the controller of kind `K` until shutdown
    async fn run_kind<K: AtlasResource>(
        &self,
        stream: impl Stream<Item = std::result::Result<K, watcher::Error>> + Send + 'static,
        reader: Store<K>,
        registry: VersionRegistry<K>,
    ) -> Result<()> {
        let kind = K::kind(&()).to_string();
        let dispatcher = Dispatcher::new(registry, self.connection.clone(), self.clients.clone());
        let reconciler = Arc::new(StateReconciler::new(
            self.client.clone(),
            Arc::new(dispatcher),
            self.config.pass_settings(),
            Some(ControllerMetrics::new(&kind)),
        ));

        let mut controller = stream_controller(stream, reader, self.config.concurrency);
        for target in referenced_kinds::<K>() {
            if target == TargetKind::SECRET {
                controller = controller.watches(
                    self.api::<Secret>(),
                    watcher::Config::default().labels(&credentials_selector()),
                    self.router.mapper::<K, Secret>(target),
                );
            } else if target == TargetKind::GROUP {
                controller = controller.watches(
                    self.api::<Group>(),
                    watcher::Config::default(),
                    self.router.mapper::<K, Group>(target),
                );
            } else {
                warn!(%kind, target = target.kind, "No watch available for referenced kind");
            }
        }

        info!(
            %kind,
            namespace = self.config.namespace.as_deref().unwrap_or("all"),
            concurrency = self.config.concurrency,
            "Starting controller"
        );

        controller
            .shutdown_on_signal()
            .run(reconcile::<K>, error_policy::<K>, reconciler)
            .for_each(|result| async move {
                match result {
                    Ok((obj, action)) => {
                        debug!(
                            name = obj.name,
                            namespace = obj.namespace,
                            ?action,
                            "Reconciliation completed"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Reconciliation failed");
                    }
                }
            })
            .await;

        info!(%kind, "Controller stopped");
        Ok(())
    }
}

/// Run the Group and DatabaseUser controllers until shutdown
pub async fn run(client: Client, config: OperatorConfig) -> Result<()> {
    let ctx = OperatorContext::new(client, config.validated()?)?;
    info!(
        dry_run = ctx.config.dry_run,
        object_deletion_protection = ctx.config.object_deletion_protection,
        subobject_deletion_protection = ctx.config.subobject_deletion_protection,
        "Starting Atlas controllers"
    );

    let (group_reader, group_stream) = ctx.primary_stream::<Group>();
    let (user_reader, user_stream) = ctx.primary_stream::<DatabaseUser>();

    let groups = group_controller::registry(GroupHandlerDeps {
        secrets: ctx.secrets.clone(),
        router: ctx.router.clone(),
        guard: DeletionProtectionGuard::new(ctx.config.subobject_deletion_protection),
        object_deletion_protection: ctx.config.object_deletion_protection,
    });
    let users = database_user_controller::registry(DatabaseUserHandlerDeps {
        secrets: ctx.secrets.clone(),
        groups: group_reader.clone(),
        object_deletion_protection: ctx.config.object_deletion_protection,
    });

    tokio::try_join!(
        ctx.run_kind(group_stream, group_reader, groups),
        ctx.run_kind(user_stream, user_reader, users),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DatabaseUserSpec, DatabaseUserV20250312, LocalObjectReference};
    use kube::runtime::reflector::ObjectRef;

    #[test]
    fn test_credentials_selector() {
        assert_eq!(credentials_selector(), "atlas.mongodb.com/type=credentials");
    }

    #[test]
    fn test_metrics_without_recorder() {
        let metrics = ControllerMetrics::new("Group");
        metrics.reconciliations.increment(1);
        metrics.errors.increment(1);
        metrics.duration.record(0.5);
    }

    #[tokio::test]
    async fn test_controller_shares_reflector_store() {
        let (reader, mut writer) = reflector::store::<Group>();
        let mut group = Group::new("my-group", Default::default());
        group.metadata.namespace = Some("team".to_string());
        writer.apply_watcher_event(&watcher::Event::Apply(group));

        let controller = stream_controller(
            futures::stream::empty::<std::result::Result<Group, watcher::Error>>(),
            reader,
            2,
        );
        let store = controller.store();
        assert!(store
            .get(&ObjectRef::new("my-group").within("team"))
            .is_some());
    }

    #[test]
    fn test_database_users_watch_groups_and_secrets() {
        let kinds = referenced_kinds::<DatabaseUser>();
        assert!(kinds.contains(&TargetKind::GROUP));
        assert!(kinds.contains(&TargetKind::SECRET));
        assert_eq!(referenced_kinds::<Group>().len(), 1);
    }

    #[test]
    fn test_group_change_maps_to_referencing_users() {
        let index = Arc::new(ReferenceIndex::new());
        let router = DependentWatchRouter::new(index.clone());
        let mut user = DatabaseUser::new(
            "app",
            DatabaseUserSpec {
                connection_secret_ref: None,
                v20250312: Some(DatabaseUserV20250312 {
                    username: "app".to_string(),
                    group_ref: Some(LocalObjectReference::new("my-group")),
                    ..Default::default()
                }),
            },
        );
        user.metadata.namespace = Some("team".to_string());
        index.upsert(&user);

        let mapper = router.mapper::<DatabaseUser, Group>(TargetKind::GROUP);
        let mut group = Group::new("my-group", Default::default());
        group.metadata.namespace = Some("team".to_string());
        assert_eq!(
            mapper(group),
            vec![ObjectRef::<DatabaseUser>::new("app").within("team")]
        );

        let mut other = Group::new("my-group", Default::default());
        other.metadata.namespace = Some("elsewhere".to_string());
        assert!(mapper(other).is_empty());
    }
}
