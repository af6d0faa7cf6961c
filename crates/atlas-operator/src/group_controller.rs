//! Group handler
//!
//! Reconciles an Atlas project through either Admin API version. The
//! 2025-03-12 block also manages the project sub-resources; each of them is a
//! protected domain reconciled on its own and reported through its own
//! condition, so one blocked domain never stops the others.

use crate::atlas_client::{is_not_found, AtlasApi};
use crate::connection::{secret_string, SecretSource};
use crate::crd::{AtlasResource, DatabaseUser, Group, GroupObserved, GroupV20250312};
use crate::dispatch::{ApiVersion, VersionRegistry};
use crate::error::{OperatorError, Result};
use crate::indexer::TargetKind;
use crate::protection::{
    detect_destructive_drift, domain_condition, is_subset, items_by_key, keep_on_delete,
    single_item, DeletionProtectionGuard, DomainItems, ProtectedDomain,
};
use crate::state::{LifecycleState, StateHandler, StateResult};
use crate::translate::{canonical_json, decode, encode, state_tracker, Translator};
use crate::watch::DependentWatchRouter;
use async_trait::async_trait;
use kube::ResourceExt;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Annotation carrying the Atlas id of a group to adopt
pub const EXTERNAL_ID_ANNOTATION: &str = "mongodb.com/external-id";

/// Poll interval while Atlas finishes a deletion
const DELETION_POLL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AtlasGroup {
    id: String,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    cluster_count: Option<i64>,
}

/// Group translator bound to one API version
pub struct GroupTranslator {
    version: ApiVersion,
}

impl GroupTranslator {
    pub fn new(version: ApiVersion) -> Self {
        Self { version }
    }
}

impl Translator<Group> for GroupTranslator {
    fn version(&self) -> ApiVersion {
        self.version
    }

    fn to_api(&self, obj: &Group) -> Result<Value> {
        let missing = || {
            OperatorError::Internal(format!("group has no {} block", self.version.as_str()))
        };
        let body = match self.version {
            ApiVersion::V20231115 => {
                let spec = obj.spec.v20231115.as_ref().ok_or_else(missing)?;
                json!({
                    "name": spec.name,
                    "orgId": spec.org_id,
                    "withDefaultAlertsSettings": spec.with_default_alerts_settings,
                    "tags": spec.tags,
                })
            }
            ApiVersion::V20250312 => {
                let spec = obj.spec.v20250312.as_ref().ok_or_else(missing)?;
                json!({
                    "name": spec.name,
                    "orgId": spec.org_id,
                    "withDefaultAlertsSettings": spec.with_default_alerts_settings,
                    "regionUsageRestrictions": spec.region_usage_restrictions,
                    "tags": spec.tags,
                })
            }
        };
        let mut body = body;
        crate::translate::strip_nulls(&mut body);
        Ok(body)
    }

    fn from_api(&self, obj: &mut Group, response: &Value) -> Result<()> {
        let group: AtlasGroup = decode(response, "group")?;
        let observed = observed_mut(obj, self.version);
        observed.id = Some(group.id);
        observed.created = group.created;
        observed.cluster_count = group.cluster_count;
        Ok(())
    }
}

fn observed_mut(obj: &mut Group, version: ApiVersion) -> &mut GroupObserved {
    let status = obj.status_mut();
    let slot = match version {
        ApiVersion::V20231115 => &mut status.v20231115,
        ApiVersion::V20250312 => &mut status.v20250312,
    };
    slot.get_or_insert_with(GroupObserved::default)
}

fn observed(obj: &Group, version: ApiVersion) -> Option<&GroupObserved> {
    let status = obj.status.as_ref()?;
    match version {
        ApiVersion::V20231115 => status.v20231115.as_ref(),
        ApiVersion::V20250312 => status.v20250312.as_ref(),
    }
}

/// Fields Atlas accepts when updating a group
fn update_body(body: &Value) -> Value {
    let mut update = Map::new();
    for field in ["name", "tags"] {
        if let Some(value) = body.get(field) {
            update.insert(field.to_string(), value.clone());
        }
    }
    Value::Object(update)
}

/// How items are created in a collection domain
#[derive(Debug, Clone, Copy)]
enum Create {
    /// POST a one-element array to the collection
    PostList,
    /// POST the item to the collection
    PostItem,
    /// POST the item to `collection/{key}`
    PostKeyed,
}

/// How an existing item is overwritten
#[derive(Debug, Clone, Copy)]
enum Update {
    /// Same call as creation
    Recreate,
    /// PATCH `collection/{key}` without the key field
    PatchKeyed,
    /// PUT the item to `collection/{key}`
    PutKeyed,
}

#[derive(Debug, Clone, Copy)]
enum Layout {
    Collection {
        key_fields: &'static [&'static str],
        create: Create,
        update: Update,
    },
    Single,
}

/// One protected sub-resource of a group
#[derive(Debug, Clone, Copy)]
struct DomainTable {
    domain: ProtectedDomain,
    path: &'static str,
    layout: Layout,
}

static DOMAINS: [DomainTable; 8] = [
    DomainTable {
        domain: ProtectedDomain::IpAccessList,
        path: "accessList",
        layout: Layout::Collection {
            key_fields: &["ipAddress", "awsSecurityGroup", "cidrBlock"],
            create: Create::PostList,
            update: Update::Recreate,
        },
    },
    DomainTable {
        domain: ProtectedDomain::CustomRoles,
        path: "customDBRoles/roles",
        layout: Layout::Collection {
            key_fields: &["roleName"],
            create: Create::PostItem,
            update: Update::PatchKeyed,
        },
    },
    DomainTable {
        domain: ProtectedDomain::TeamAssignment,
        path: "teams",
        layout: Layout::Collection {
            key_fields: &["teamId"],
            create: Create::PostList,
            update: Update::PatchKeyed,
        },
    },
    DomainTable {
        domain: ProtectedDomain::Integrations,
        path: "integrations",
        layout: Layout::Collection {
            key_fields: &["type"],
            create: Create::PostKeyed,
            update: Update::PutKeyed,
        },
    },
    DomainTable {
        domain: ProtectedDomain::MaintenanceWindow,
        path: "maintenanceWindow",
        layout: Layout::Single,
    },
    DomainTable {
        domain: ProtectedDomain::Auditing,
        path: "auditLog",
        layout: Layout::Single,
    },
    DomainTable {
        domain: ProtectedDomain::Settings,
        path: "settings",
        layout: Layout::Single,
    },
    DomainTable {
        domain: ProtectedDomain::EncryptionAtRest,
        path: "encryptionAtRest",
        layout: Layout::Single,
    },
];

fn encode_all<T: serde::Serialize>(items: &[T]) -> Result<Vec<Value>> {
    items.iter().map(encode).collect()
}

/// Desired items of a domain, `None` when the spec leaves it unmanaged
fn desired_items(domain: ProtectedDomain, spec: &GroupV20250312) -> Result<Option<DomainItems>> {
    let keyed = |values: Vec<Value>, table_keys: &[&str]| items_by_key(&values, table_keys);
    Ok(match domain {
        ProtectedDomain::IpAccessList => match &spec.ip_access_list {
            Some(entries) => Some(keyed(
                encode_all(entries)?,
                &["ipAddress", "awsSecurityGroup", "cidrBlock"],
            )),
            None => None,
        },
        ProtectedDomain::CustomRoles => match &spec.custom_roles {
            Some(roles) => Some(keyed(encode_all(roles)?, &["roleName"])),
            None => None,
        },
        ProtectedDomain::TeamAssignment => match &spec.teams {
            Some(teams) => Some(keyed(encode_all(teams)?, &["teamId"])),
            None => None,
        },
        ProtectedDomain::Integrations => spec.integrations.as_ref().map(|integrations| {
            integrations
                .iter()
                .map(|integration| {
                    let mut item = Map::new();
                    item.insert("type".to_string(), json!(integration.integration_type));
                    for (k, v) in &integration.settings {
                        item.insert(k.clone(), json!(v));
                    }
                    (integration.integration_type.clone(), Value::Object(item))
                })
                .collect()
        }),
        ProtectedDomain::MaintenanceWindow => match &spec.maintenance_window {
            Some(window) => Some(single_item(Some(&encode(window)?))),
            None => None,
        },
        ProtectedDomain::Auditing => match &spec.auditing {
            Some(auditing) => Some(single_item(Some(&encode(auditing)?))),
            None => None,
        },
        ProtectedDomain::Settings => match &spec.settings {
            Some(settings) => Some(single_item(Some(&encode(settings)?))),
            None => None,
        },
        ProtectedDomain::EncryptionAtRest => match &spec.encryption_at_rest {
            Some(encryption) => Some(single_item(Some(&encode(encryption)?))),
            None => None,
        },
        ProtectedDomain::CloudProviderAccess | ProtectedDomain::NetworkPeering => None,
    })
}

/// Items of a list response, bare or wrapped in `results`
fn list_items(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::Object(map) => map
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn merged(item: &Value, extra: Option<&Map<String, Value>>) -> Value {
    let mut item = item.clone();
    if let (Value::Object(target), Some(extra)) = (&mut item, extra) {
        for (k, v) in extra {
            target.insert(k.clone(), v.clone());
        }
    }
    item
}

fn without_fields(item: &Value, fields: &[&str]) -> Value {
    let mut item = item.clone();
    if let Value::Object(map) = &mut item {
        for field in fields {
            map.remove(*field);
        }
    }
    item
}

/// Secret values of the integrations keyed by integration type
#[derive(Debug, Default)]
struct IntegrationSecrets {
    fields: BTreeMap<String, Map<String, Value>>,
    fingerprints: Vec<String>,
}

/// Tracker inputs of the integration secrets, or a marker while they are missing
fn fingerprints(secrets: &Result<IntegrationSecrets>) -> Vec<String> {
    match secrets {
        Ok(secrets) => secrets.fingerprints.clone(),
        Err(_) => vec!["integrations:unresolved".to_string()],
    }
}

/// Collaborators shared by every group handler
#[derive(Clone)]
pub struct GroupHandlerDeps {
    pub secrets: Arc<dyn SecretSource>,
    pub router: DependentWatchRouter,
    pub guard: DeletionProtectionGuard,
    /// Keep the Atlas project when the resource is deleted
    pub object_deletion_protection: bool,
}

/// Register both group versions
pub fn registry(deps: GroupHandlerDeps) -> VersionRegistry<Group> {
    ApiVersion::ALL
        .into_iter()
        .fold(VersionRegistry::new(), |registry, version| {
            let deps = deps.clone();
            registry.register(
                Arc::new(GroupTranslator::new(version)),
                move |client, translator| {
                    Arc::new(GroupHandler::new(client, translator, deps.clone()))
                },
            )
        })
}

/// Lifecycle callbacks of a group bound to one API version
pub struct GroupHandler {
    client: Arc<dyn AtlasApi>,
    translator: Arc<dyn Translator<Group>>,
    deps: GroupHandlerDeps,
}

impl GroupHandler {
    pub fn new(
        client: Arc<dyn AtlasApi>,
        translator: Arc<dyn Translator<Group>>,
        deps: GroupHandlerDeps,
    ) -> Self {
        Self {
            client,
            translator,
            deps,
        }
    }

    /// Create the group unless an earlier pass or someone else already did
    async fn create(&self, obj: &mut Group) -> Result<StateResult> {
        if obj.atlas_id().is_none() {
            let body = self.translator.to_api(obj)?;
            let name = body.get("name").and_then(Value::as_str).unwrap_or_default();
            let by_name = format!("/groups/byName/{}", urlencoding::encode(name));
            match self.client.get(&by_name).await {
                Ok(existing) => {
                    self.translator.from_api(obj, &existing)?;
                    info!(id = obj.atlas_id().unwrap_or_default(), "Adopted existing Atlas group");
                }
                Err(e) if is_not_found(&e) => {
                    let response = self.client.post("/groups", &body).await?;
                    self.translator.from_api(obj, &response)?;
                    info!(id = obj.atlas_id().unwrap_or_default(), "Created Atlas group");
                }
                Err(e) => return Err(e),
            }
        }

        let secrets = self.integration_secrets(obj).await;
        let result = self.reconcile_domains(obj, true, secrets).await?;
        Ok(StateResult {
            message: Some("Group is created.".to_string()),
            next_state: LifecycleState::Created,
            ..result
        })
    }

    /// Push spec changes of a settled group
    async fn upsert(&self, obj: &mut Group, settled: LifecycleState) -> Result<StateResult> {
        let Some(id) = obj.atlas_id().map(str::to_string) else {
            return self.create(obj).await;
        };

        let secrets = self.integration_secrets(obj).await;
        let tracker = state_tracker(&self.version_block(obj)?, &fingerprints(&secrets));
        let changed = obj.status_ref().and_then(|s| s.state_tracker.as_deref())
            != Some(tracker.as_str());

        if changed {
            let body = self.translator.to_api(obj)?;
            let response = self
                .client
                .patch(&format!("/groups/{}", id), &update_body(&body))
                .await?;
            self.translator.from_api(obj, &response)?;
            debug!(%id, "Updated Atlas group");
        }

        let result = self.reconcile_domains(obj, changed, secrets).await?;
        if changed {
            Ok(StateResult {
                message: Some("Group is updated.".to_string()),
                next_state: LifecycleState::Updated,
                ..result
            })
        } else {
            Ok(StateResult {
                next_state: settled,
                ..result
            })
        }
    }

    fn version_block(&self, obj: &Group) -> Result<Value> {
        match self.version() {
            ApiVersion::V20231115 => encode(&obj.spec.v20231115),
            ApiVersion::V20250312 => encode(&obj.spec.v20250312),
        }
    }

    async fn integration_secrets(&self, obj: &Group) -> Result<IntegrationSecrets> {
        let mut resolved = IntegrationSecrets::default();
        let Some(integrations) = obj
            .spec
            .v20250312
            .as_ref()
            .and_then(|s| s.integrations.as_ref())
        else {
            return Ok(resolved);
        };
        let namespace = obj.namespace().unwrap_or_default();

        for integration in integrations {
            for credential in &integration.credentials {
                let secret = self
                    .deps
                    .secrets
                    .get_secret(&namespace, &credential.secret_ref.name)
                    .await?
                    .ok_or_else(|| OperatorError::SecretNotFound {
                        name: credential.secret_ref.name.clone(),
                    })?;
                let value = secret_string(&secret, &credential.key)?;
                resolved.fingerprints.push(format!(
                    "{}/{}/{}:{}",
                    namespace,
                    credential.secret_ref.name,
                    credential.key,
                    hex::encode(Sha256::digest(value.as_bytes()))
                ));
                resolved
                    .fields
                    .entry(integration.integration_type.clone())
                    .or_default()
                    .insert(credential.field.clone(), Value::String(value));
            }
        }
        Ok(resolved)
    }

    /// Reconcile every declared domain and store the state tracker.
    ///
    /// Domain failures become conditions; the returned error is reserved for
    /// failures of the pass itself. Unresolved integration secrets are part of
    /// the tracker, so resolving them later counts as a change.
    async fn reconcile_domains(
        &self,
        obj: &mut Group,
        force: bool,
        secrets: Result<IntegrationSecrets>,
    ) -> Result<StateResult> {
        let mut result = StateResult::unchanged(LifecycleState::Created);
        let fingerprints = fingerprints(&secrets);
        let (secrets, mut secrets_error) = match secrets {
            Ok(secrets) => (secrets, None),
            Err(e) => (IntegrationSecrets::default(), Some(e)),
        };

        let spec = match self.version() {
            ApiVersion::V20250312 => obj.spec.v20250312.clone(),
            ApiVersion::V20231115 => None,
        };
        if let Some(spec) = spec {
            let id = obj
                .atlas_id()
                .map(str::to_string)
                .ok_or_else(|| OperatorError::Internal("group has no Atlas id".to_string()))?;

            for table in &DOMAINS {
                let condition_type = table.domain.condition_type();
                let Some(desired) = desired_items(table.domain, &spec)? else {
                    observed_mut(obj, self.version())
                        .applied_domains
                        .remove(condition_type);
                    result = result.clearing(condition_type);
                    continue;
                };

                let pending = match table.domain {
                    ProtectedDomain::Integrations => secrets_error.take(),
                    _ => None,
                };
                let outcome = match pending {
                    Some(e) => Err(e),
                    None => {
                        let last_applied = observed(obj, self.version())
                            .map(|o| o.applied(condition_type))
                            .unwrap_or_default();
                        self.reconcile_domain(table, &id, &desired, &last_applied, &secrets.fields, force)
                            .await
                    }
                };

                match &outcome {
                    Ok(()) => {
                        observed_mut(obj, self.version()).applied_domains.insert(
                            condition_type.to_string(),
                            canonical_json(&serde_json::to_value(&desired)?),
                        );
                    }
                    Err(e) => {
                        warn!(domain = table.domain.display_name(), error = %e, "Domain not reconciled");
                    }
                }
                result = result.with_condition(domain_condition(table.domain, &outcome));
            }
        }

        let tracker = state_tracker(&self.version_block(obj)?, &fingerprints);
        obj.status_mut().state_tracker = Some(tracker);
        Ok(result)
    }

    #[instrument(skip_all, fields(domain = table.domain.display_name()))]
    async fn reconcile_domain(
        &self,
        table: &DomainTable,
        group_id: &str,
        desired: &DomainItems,
        last_applied: &DomainItems,
        extras: &BTreeMap<String, Map<String, Value>>,
        force: bool,
    ) -> Result<()> {
        let base = format!("/groups/{}/{}", group_id, table.path);
        let response = self.client.get(&base).await?;

        match table.layout {
            Layout::Single => {
                let observed = single_item(Some(&response));
                let conflicts =
                    detect_destructive_drift(table.domain, desired, &observed, last_applied);
                let Some(wanted) = desired.values().next() else {
                    return Ok(());
                };
                let actual = observed.values().next();
                if actual.is_some_and(|a| is_subset(wanted, a)) {
                    return Ok(());
                }
                self.deps
                    .guard
                    .guard(table.domain, &conflicts, || async {
                        self.client.patch(&base, wanted).await.map(|_| ())
                    })
                    .await
            }
            Layout::Collection {
                key_fields,
                create,
                update,
            } => {
                let observed = items_by_key(&list_items(&response), key_fields);
                let conflicts =
                    detect_destructive_drift(table.domain, desired, &observed, last_applied);

                self.deps
                    .guard
                    .guard(table.domain, &conflicts, || async {
                        for (key, item) in desired {
                            let extra = extras.get(key);
                            let body = merged(item, extra);
                            let keyed = format!("{}/{}", base, urlencoding::encode(key));
                            match observed.get(key) {
                                None => match create {
                                    Create::PostList => {
                                        self.client.post(&base, &json!([body])).await?;
                                    }
                                    Create::PostItem => {
                                        self.client.post(&base, &body).await?;
                                    }
                                    Create::PostKeyed => {
                                        self.client.post(&keyed, &body).await?;
                                    }
                                },
                                Some(actual) if !is_subset(item, actual) || (force && extra.is_some()) => {
                                    match update {
                                        Update::Recreate => {
                                            self.client.post(&base, &json!([body])).await?;
                                        }
                                        Update::PatchKeyed => {
                                            self.client
                                                .patch(&keyed, &without_fields(&body, key_fields))
                                                .await?;
                                        }
                                        Update::PutKeyed => {
                                            self.client.put(&keyed, &body).await?;
                                        }
                                    }
                                }
                                Some(_) => {}
                            }
                        }
                        for key in observed.keys().filter(|k| !desired.contains_key(*k)) {
                            self.client
                                .delete(&format!("{}/{}", base, urlencoding::encode(key)))
                                .await?;
                        }
                        Ok::<(), OperatorError>(())
                    })
                    .await
            }
        }
    }
}

#[async_trait]
impl StateHandler<Group> for GroupHandler {
    fn version(&self) -> ApiVersion {
        self.translator.version()
    }

    #[instrument(skip_all, fields(group = %obj.name_any()))]
    async fn handle_initial(&self, obj: &mut Group) -> Result<StateResult> {
        self.create(obj).await
    }

    #[instrument(skip_all, fields(group = %obj.name_any()))]
    async fn handle_import_requested(&self, obj: &mut Group) -> Result<StateResult> {
        let id = obj
            .annotations()
            .get(EXTERNAL_ID_ANNOTATION)
            .cloned()
            .ok_or_else(|| {
                OperatorError::Validation(format!(
                    "import requested but annotation {} is missing",
                    EXTERNAL_ID_ANNOTATION
                ))
            })?;
        let response = self.client.get(&format!("/groups/{}", id)).await?;
        self.translator.from_api(obj, &response)?;
        info!(%id, "Imported Atlas group");
        Ok(StateResult::next(LifecycleState::Imported, "Group is imported."))
    }

    async fn handle_imported(&self, obj: &mut Group) -> Result<StateResult> {
        self.upsert(obj, LifecycleState::Imported).await
    }

    async fn handle_creating(&self, obj: &mut Group) -> Result<StateResult> {
        self.upsert(obj, LifecycleState::Created).await
    }

    async fn handle_created(&self, obj: &mut Group) -> Result<StateResult> {
        self.upsert(obj, LifecycleState::Created).await
    }

    async fn handle_updating(&self, obj: &mut Group) -> Result<StateResult> {
        self.upsert(obj, LifecycleState::Updated).await
    }

    async fn handle_updated(&self, obj: &mut Group) -> Result<StateResult> {
        self.upsert(obj, LifecycleState::Updated).await
    }

    #[instrument(skip_all, fields(group = %obj.name_any()))]
    async fn handle_deletion_requested(&self, obj: &mut Group) -> Result<StateResult> {
        let namespace = obj.namespace().unwrap_or_default();
        let dependents =
            self.deps
                .router
                .dependents::<DatabaseUser>(&TargetKind::GROUP, &namespace, &obj.name_any());
        if !dependents.is_empty() {
            return Err(OperatorError::DependencyNotReady(format!(
                "failed to delete group because {} resources depend on it",
                dependents.len()
            )));
        }

        if keep_on_delete(obj.annotations(), self.deps.object_deletion_protection) {
            info!("Keeping Atlas group, releasing resource");
            return Ok(StateResult::next(LifecycleState::Deleted, "Deleted"));
        }

        let Some(id) = obj.atlas_id().map(str::to_string) else {
            return Ok(StateResult::next(LifecycleState::Deleted, "Deleted"));
        };

        match self.client.delete(&format!("/groups/{}", id)).await {
            Ok(()) => {
                info!(%id, "Deleting Atlas group");
                Ok(StateResult::next(LifecycleState::Deleting, "Deleting group.")
                    .requeue_after(DELETION_POLL))
            }
            Err(e) if is_not_found(&e) => Ok(StateResult::next(LifecycleState::Deleted, "Deleted")),
            Err(e) => Err(e),
        }
    }

    async fn handle_deleting(&self, obj: &mut Group) -> Result<StateResult> {
        let Some(id) = obj.atlas_id().map(str::to_string) else {
            return Ok(StateResult::next(LifecycleState::Deleted, "Deleted"));
        };
        match self.client.get(&format!("/groups/{}", id)).await {
            Ok(_) => Ok(StateResult::unchanged(LifecycleState::Deleting).requeue_after(DELETION_POLL)),
            Err(e) if is_not_found(&e) => Ok(StateResult::next(LifecycleState::Deleted, "Deleted")),
            Err(e) => Err(e),
        }
    }
}
