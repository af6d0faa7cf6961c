//! State reconciler
//!
//! Drives one reconcile pass of any [`AtlasResource`]:
//!
//! 1. Fetch the object; a missing object is already deleted.
//! 2. Honour the skip annotation and make sure the finalizer is present.
//! 3. Derive the entry state from the `State` condition, the deletion
//!    timestamp and the import annotations.
//! 4. Resolve the version-bound handler and invoke the callback of that state.
//! 5. Merge the returned conditions, recompute `State` and `Ready`, and write
//!    status only when it changed, using the resource version for optimistic
//!    concurrency.
//!
//! [`execute_pass`] holds steps 3 to 5 without touching the Kubernetes API so
//! the lifecycle rules can be tested with in-memory handlers.

use crate::conditions::{self, READY, STATE};
use crate::controller::ControllerMetrics;
use crate::crd::{AtlasResource, Condition, ConditionStatus};
use crate::dispatch::HandlerResolver;
use crate::error::{ErrorClass, OperatorError, Result};
use crate::state::{current_state, dispatch_state, observed_generation, LifecycleState, StateHandler};
use dashmap::DashMap;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Finalizer guarding the external resource
pub const FINALIZER: &str = "mongodb.com/finalizer";

/// `skip` suspends reconciliation of the object
pub const RECONCILIATION_POLICY_ANNOTATION: &str = "mongodb.com/atlas-reconciliation-policy";

/// Per-object drift check cadence, e.g. `2h`
pub const REAPPLY_PERIOD_ANNOTATION: &str = "mongodb.com/reapply-period";

/// Any annotation with this prefix asks to adopt an existing Atlas resource
pub const EXTERNAL_ANNOTATION_PREFIX: &str = "mongodb.com/external-";

/// Status writes retried on conflict before the pass is abandoned
const STATUS_CONFLICT_RETRIES: u32 = 3;

/// Base of the exponential backoff for transient errors
const ERROR_REQUEUE_SECONDS: u64 = 5;

/// Cap of the exponential backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 300;

/// Timing knobs of a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassSettings {
    /// Requeue delay for errors and blocked domains that wait on the user
    pub hold_interval: Duration,
    /// Drift check cadence of settled objects
    pub reapply_period: Duration,
}

/// When the object should be looked at again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    After(Duration),
    /// Only on the next watch event
    AwaitChange,
    /// Exponential backoff through the error policy
    Backoff,
}

/// Result of [`execute_pass`]
#[derive(Debug)]
pub struct PassOutcome {
    pub previous_state: LifecycleState,
    pub next_state: LifecycleState,
    pub release_finalizer: bool,
    pub requeue: Requeue,
    pub error: Option<OperatorError>,
}

/// Lifecycle state this pass starts from
pub fn entry_state<K: AtlasResource>(obj: &K) -> LifecycleState {
    let current = current_state(obj.conditions());
    if obj.meta().deletion_timestamp.is_some() {
        return match current {
            LifecycleState::DeletionRequested | LifecycleState::Deleting => current,
            _ => LifecycleState::DeletionRequested,
        };
    }
    if current == LifecycleState::Initial && wants_import(obj.annotations()) {
        return LifecycleState::ImportRequested;
    }
    current
}

fn wants_import(annotations: &BTreeMap<String, String>) -> bool {
    annotations
        .keys()
        .any(|k| k.starts_with(EXTERNAL_ANNOTATION_PREFIX))
}

/// Whether reconciliation is suspended for the object
pub fn is_skipped(annotations: &BTreeMap<String, String>) -> bool {
    annotations
        .get(RECONCILIATION_POLICY_ANNOTATION)
        .is_some_and(|v| v == "skip")
}

/// Reapply period from the annotation, falling back to `default`
pub fn reapply_period(annotations: &BTreeMap<String, String>, default: Duration) -> Duration {
    match annotations.get(REAPPLY_PERIOD_ANNOTATION) {
        Some(raw) => match humantime::parse_duration(raw) {
            Ok(period) if !period.is_zero() => period,
            _ => {
                warn!(value = %raw, "Ignoring invalid reapply period annotation");
                default
            }
        },
        None => default,
    }
}

/// Run one lifecycle step on `obj` and fold its result into status.
///
/// `resolved` is the outcome of handler resolution; a failure there is
/// reported like any handler error and leaves the state where it was.
pub async fn execute_pass<K: AtlasResource>(
    obj: &mut K,
    resolved: Result<Arc<dyn StateHandler<K>>>,
    settings: &PassSettings,
) -> PassOutcome {
    let previous_conditions = obj.conditions().to_vec();
    let previous_state = current_state(&previous_conditions);
    let entry = entry_state(obj);

    let result = match resolved {
        Ok(handler) => dispatch_state(handler.as_ref(), entry, obj).await,
        Err(e) => Err(e),
    };

    let (next_state, message, requeue_after, error) = match result {
        Ok(result) => {
            let generation = obj.meta().generation;
            let current = obj.conditions_mut();
            for mut condition in result.conditions {
                condition.observed_generation = condition.observed_generation.or(generation);
                conditions::set(current, condition);
            }
            for cleared in &result.cleared {
                conditions::remove(current, cleared);
            }
            (result.next_state, result.message, result.requeue_after, None)
        }
        Err(e) => (entry, None, None, Some(e)),
    };

    if next_state == LifecycleState::Deleted {
        return PassOutcome {
            previous_state,
            next_state,
            release_finalizer: true,
            requeue: Requeue::AwaitChange,
            error,
        };
    }

    let generation = observed_generation(obj.meta().generation, &previous_conditions, next_state);
    let message = message.or_else(|| {
        conditions::find(&previous_conditions, STATE).and_then(|c| c.message.clone())
    });

    let current = obj.conditions_mut();
    let state_status = if error.is_some() {
        ConditionStatus::False
    } else {
        ConditionStatus::True
    };
    conditions::set(
        current,
        Condition {
            observed_generation: generation,
            ..Condition::new(STATE, state_status, Some(next_state.as_str()), message)
        },
    );
    let ready = Condition {
        observed_generation: generation,
        ..conditions::aggregate_ready(next_state, error.as_ref(), current)
    };
    let ready_ok = ready.is_true();
    conditions::set(current, ready);

    let requeue = match &error {
        Some(e) => match e.class() {
            ErrorClass::Hold => Requeue::After(settings.hold_interval),
            ErrorClass::Transient | ErrorClass::Propagate => Requeue::Backoff,
        },
        None => match requeue_after {
            Some(delay) => Requeue::After(delay),
            None if next_state.is_settled() && ready_ok => {
                Requeue::After(reapply_period(obj.annotations(), settings.reapply_period))
            }
            None if next_state.is_settled() => Requeue::After(settings.hold_interval),
            None => Requeue::After(Duration::ZERO),
        },
    };

    PassOutcome {
        previous_state,
        next_state,
        release_finalizer: false,
        requeue,
        error,
    }
}

/// Exponential backoff: 5s, 10s, 20s, ... capped at 300s
pub fn backoff_delay(retries: u32) -> Duration {
    let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
    let backoff = base * 2u32.saturating_pow(retries.saturating_sub(1).min(6));
    backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
}

/// Controller context reconciling one kind
pub struct StateReconciler<K> {
    client: Client,
    resolver: Arc<dyn HandlerResolver<K>>,
    settings: PassSettings,
    metrics: Option<ControllerMetrics>,
    /// Per-object error retry counts for exponential backoff
    error_counts: DashMap<String, u32>,
}

impl<K: AtlasResource> StateReconciler<K> {
    pub fn new(
        client: Client,
        resolver: Arc<dyn HandlerResolver<K>>,
        settings: PassSettings,
        metrics: Option<ControllerMetrics>,
    ) -> Self {
        Self {
            client,
            resolver,
            settings,
            metrics,
            error_counts: DashMap::new(),
        }
    }

    async fn reconcile_object(&self, obj: &K) -> Result<Action> {
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);

        let Some(mut current) = api.get_opt(&name).await? else {
            debug!("Object no longer exists");
            return Ok(Action::await_change());
        };
        let deleting = current.meta().deletion_timestamp.is_some();

        if is_skipped(current.annotations()) {
            info!("Reconciliation skipped by annotation");
            if deleting && has_finalizer(&current) {
                remove_finalizer(&api, &current).await?;
            }
            return Ok(Action::await_change());
        }

        if !has_finalizer(&current) {
            if deleting {
                return Ok(Action::await_change());
            }
            current = add_finalizer(&api, &current).await?;
        }

        let resolved = self.resolver.resolve(&current).await;
        let before = current.status_ref().cloned();
        let outcome = execute_pass(&mut current, resolved, &self.settings).await;

        if outcome.previous_state != outcome.next_state {
            info!(
                from = %outcome.previous_state,
                to = %outcome.next_state,
                "State transition"
            );
            metrics::counter!(
                "atlas_operator_state_transitions_total",
                "kind" => K::kind(&()).to_string(),
                "from" => outcome.previous_state.as_str(),
                "to" => outcome.next_state.as_str()
            )
            .increment(1);
        }

        if outcome.release_finalizer {
            remove_finalizer(&api, &current).await?;
            info!("Finalizer released");
            return Ok(Action::await_change());
        }

        if current.status_ref() != before.as_ref() {
            self.write_status(&api, &current).await?;
        } else {
            debug!("Status unchanged, skipping write");
        }

        match outcome.error {
            Some(e) if e.class() != ErrorClass::Hold => Err(e),
            Some(e) => {
                warn!(error = %e, reason = e.ready_reason(), "Reconciliation held");
                Ok(requeue_action(outcome.requeue))
            }
            None => Ok(requeue_action(outcome.requeue)),
        }
    }

    /// Persist the status computed by a pass.
    ///
    /// A conflict re-reads the object and re-applies the status as long as
    /// the spec generation is unchanged; otherwise the whole pass is retried.
    async fn write_status(&self, api: &Api<K>, obj: &K) -> Result<()> {
        let name = obj.name_any();
        let mut resource_version = obj.resource_version();

        for attempt in 0..STATUS_CONFLICT_RETRIES {
            let patch = json!({
                "metadata": { "resourceVersion": resource_version },
                "status": obj.status_ref(),
            });
            match api
                .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    debug!(attempt, "Status write conflicted, re-reading object");
                    let Some(latest) = api.get_opt(&name).await? else {
                        return Ok(());
                    };
                    if latest.meta().generation != obj.meta().generation {
                        break;
                    }
                    resource_version = latest.resource_version();
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(OperatorError::Conflict(format!("{}/{}", obj.namespace().unwrap_or_default(), name)))
    }
}

fn requeue_action(requeue: Requeue) -> Action {
    match requeue {
        Requeue::After(delay) => Action::requeue(delay),
        Requeue::AwaitChange | Requeue::Backoff => Action::await_change(),
    }
}

fn has_finalizer<K: Resource>(obj: &K) -> bool {
    obj.finalizers().iter().any(|f| f == FINALIZER)
}

async fn add_finalizer<K: AtlasResource>(api: &Api<K>, obj: &K) -> Result<K> {
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": obj.resource_version(),
        }
    });
    debug!("Adding finalizer");
    Ok(api
        .patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?)
}

async fn remove_finalizer<K: AtlasResource>(api: &Api<K>, obj: &K) -> Result<()> {
    let finalizers: Vec<&String> = obj.finalizers().iter().filter(|f| *f != FINALIZER).collect();
    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": obj.resource_version(),
        }
    });
    debug!("Removing finalizer");
    api.patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Reconcile entry point handed to the controller runtime
#[instrument(skip(obj, ctx), fields(kind = %K::kind(&()), name = %obj.name_any(), namespace = obj.namespace()))]
pub async fn reconcile<K: AtlasResource>(obj: Arc<K>, ctx: Arc<StateReconciler<K>>) -> Result<Action> {
    let start = Instant::now();
    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let result = ctx.reconcile_object(&obj).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    match &result {
        Ok(_) => {
            ctx.error_counts.remove(&error_key(&*obj));
        }
        Err(_) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.errors.increment(1);
            }
        }
    }
    result
}

/// Error policy: fixed hold for user-facing errors, exponential backoff otherwise
pub fn error_policy<K: AtlasResource>(
    obj: Arc<K>,
    error: &OperatorError,
    ctx: Arc<StateReconciler<K>>,
) -> Action {
    let key = error_key(&*obj);
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    let delay = error
        .requeue_delay(ctx.settings.hold_interval)
        .unwrap_or_else(|| backoff_delay(retries));

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}

fn error_key<K: Resource>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ApiVersion;
    use crate::crd::{Group, GroupSpec, GroupV20231115};
    use crate::error::SpecVersionError;
    use crate::protection::{domain_condition, ProtectedDomain};
    use crate::state::StateResult;
    use async_trait::async_trait;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use parking_lot::Mutex;

    type Script = Box<dyn Fn(LifecycleState) -> Result<StateResult> + Send + Sync>;

    /// Handler answering every state through one closure
    struct ScriptedHandler {
        script: Script,
        calls: Mutex<Vec<LifecycleState>>,
    }

    impl ScriptedHandler {
        fn new(script: impl Fn(LifecycleState) -> Result<StateResult> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                script: Box::new(script),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn run(&self, state: LifecycleState) -> Result<StateResult> {
            self.calls.lock().push(state);
            (self.script)(state)
        }

        fn calls(&self) -> Vec<LifecycleState> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl StateHandler<Group> for ScriptedHandler {
        fn version(&self) -> ApiVersion {
            ApiVersion::V20231115
        }

        async fn handle_initial(&self, _obj: &mut Group) -> Result<StateResult> {
            self.run(LifecycleState::Initial)
        }

        async fn handle_import_requested(&self, _obj: &mut Group) -> Result<StateResult> {
            self.run(LifecycleState::ImportRequested)
        }

        async fn handle_imported(&self, _obj: &mut Group) -> Result<StateResult> {
            self.run(LifecycleState::Imported)
        }

        async fn handle_creating(&self, _obj: &mut Group) -> Result<StateResult> {
            self.run(LifecycleState::Creating)
        }

        async fn handle_created(&self, _obj: &mut Group) -> Result<StateResult> {
            self.run(LifecycleState::Created)
        }

        async fn handle_updating(&self, _obj: &mut Group) -> Result<StateResult> {
            self.run(LifecycleState::Updating)
        }

        async fn handle_updated(&self, _obj: &mut Group) -> Result<StateResult> {
            self.run(LifecycleState::Updated)
        }

        async fn handle_deletion_requested(&self, _obj: &mut Group) -> Result<StateResult> {
            self.run(LifecycleState::DeletionRequested)
        }

        async fn handle_deleting(&self, _obj: &mut Group) -> Result<StateResult> {
            self.run(LifecycleState::Deleting)
        }
    }

    /// Creates on the first pass and stays settled afterwards
    fn lifecycle(state: LifecycleState) -> Result<StateResult> {
        Ok(match state {
            LifecycleState::Initial => StateResult::next(LifecycleState::Created, "Group is created."),
            LifecycleState::ImportRequested => {
                StateResult::next(LifecycleState::Imported, "Group is imported.")
            }
            LifecycleState::DeletionRequested => StateResult::next(LifecycleState::Deleted, "Deleted"),
            other => StateResult::unchanged(other),
        })
    }

    fn settings() -> PassSettings {
        PassSettings {
            hold_interval: Duration::from_secs(60),
            reapply_period: Duration::from_secs(3600),
        }
    }

    fn group() -> Group {
        let mut group = Group::new(
            "my-group",
            GroupSpec {
                v20231115: Some(GroupV20231115 {
                    name: "my-group".to_string(),
                    org_id: "5f1b5c4e8f1b2c3d4e5f6a7b".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        group.metadata.namespace = Some("team".to_string());
        group.metadata.generation = Some(1);
        group
    }

    fn resolved(handler: &Arc<ScriptedHandler>) -> Result<Arc<dyn StateHandler<Group>>> {
        Ok(handler.clone())
    }

    fn condition<'a>(group: &'a Group, condition_type: &str) -> &'a Condition {
        conditions::find(group.conditions(), condition_type).unwrap()
    }

    #[tokio::test]
    async fn test_initial_to_created() {
        let handler = ScriptedHandler::new(lifecycle);
        let mut group = group();

        let outcome = execute_pass(&mut group, resolved(&handler), &settings()).await;
        assert_eq!(outcome.previous_state, LifecycleState::Initial);
        assert_eq!(outcome.next_state, LifecycleState::Created);
        assert_eq!(outcome.requeue, Requeue::After(Duration::from_secs(3600)));
        assert!(outcome.error.is_none());

        let state = condition(&group, STATE);
        assert_eq!(state.reason.as_deref(), Some("Created"));
        assert_eq!(state.message.as_deref(), Some("Group is created."));
        assert_eq!(state.observed_generation, Some(1));

        let ready = condition(&group, READY);
        assert!(ready.is_true());
        assert_eq!(ready.message.as_deref(), Some("Resource is settled."));
    }

    #[tokio::test]
    async fn test_second_pass_causes_no_status_churn() {
        let handler = ScriptedHandler::new(lifecycle);
        let mut group = group();

        execute_pass(&mut group, resolved(&handler), &settings()).await;
        let first = group.status.clone();

        let outcome = execute_pass(&mut group, resolved(&handler), &settings()).await;
        assert_eq!(outcome.previous_state, LifecycleState::Created);
        assert_eq!(outcome.next_state, LifecycleState::Created);
        assert_eq!(group.status, first);
        assert_eq!(
            handler.calls(),
            vec![LifecycleState::Initial, LifecycleState::Created]
        );
    }

    #[tokio::test]
    async fn test_multiple_versions_never_reach_creating() {
        let mut group = group();

        for _ in 0..2 {
            let outcome = execute_pass(
                &mut group,
                Err(OperatorError::SpecVersion(SpecVersionError::Multiple)),
                &settings(),
            )
            .await;
            assert_eq!(outcome.next_state, LifecycleState::Initial);
            assert_eq!(outcome.requeue, Requeue::After(Duration::from_secs(60)));
        }

        let ready = condition(&group, READY);
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason.as_deref(), Some("MultipleSpecVersions"));
        assert_eq!(condition(&group, STATE).status, ConditionStatus::False);
    }

    #[tokio::test]
    async fn test_transient_error_keeps_state_and_backs_off() {
        let mut group = group();
        let ok = ScriptedHandler::new(lifecycle);
        execute_pass(&mut group, resolved(&ok), &settings()).await;

        let failing = ScriptedHandler::new(|_| Err(OperatorError::Timeout("GET /groups".into())));
        let outcome = execute_pass(&mut group, resolved(&failing), &settings()).await;
        assert_eq!(outcome.next_state, LifecycleState::Created);
        assert_eq!(outcome.requeue, Requeue::Backoff);
        assert!(outcome.error.is_some());

        let state = condition(&group, STATE);
        assert_eq!(state.reason.as_deref(), Some("Created"));
        assert_eq!(state.message.as_deref(), Some("Group is created."));
        assert_eq!(condition(&group, READY).status, ConditionStatus::False);
    }

    #[tokio::test]
    async fn test_deletion_timestamp_enters_deletion_requested() {
        let handler = ScriptedHandler::new(lifecycle);
        let mut group = group();
        execute_pass(&mut group, resolved(&handler), &settings()).await;

        group.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let outcome = execute_pass(&mut group, resolved(&handler), &settings()).await;
        assert_eq!(outcome.next_state, LifecycleState::Deleted);
        assert!(outcome.release_finalizer);
        assert_eq!(outcome.requeue, Requeue::AwaitChange);
        assert_eq!(handler.calls().last(), Some(&LifecycleState::DeletionRequested));
    }

    #[tokio::test]
    async fn test_import_annotation_enters_import_requested() {
        let handler = ScriptedHandler::new(lifecycle);
        let mut group = group();
        group
            .annotations_mut()
            .insert("mongodb.com/external-id".to_string(), "65f1b5c4e8f1b2c3d4e5f6a7".to_string());

        let outcome = execute_pass(&mut group, resolved(&handler), &settings()).await;
        assert_eq!(handler.calls(), vec![LifecycleState::ImportRequested]);
        assert_eq!(outcome.next_state, LifecycleState::Imported);
        assert_eq!(
            condition(&group, READY).message.as_deref(),
            Some("Resource is imported.")
        );
    }

    #[tokio::test]
    async fn test_blocked_domain_holds_ready() {
        let handler = ScriptedHandler::new(|_| {
            Ok(StateResult::next(LifecycleState::Updated, "Group is updated.")
                .with_condition(domain_condition(
                    ProtectedDomain::IpAccessList,
                    &Err(OperatorError::DeletionProtection(ProtectedDomain::IpAccessList)),
                ))
                .with_condition(domain_condition(ProtectedDomain::Auditing, &Ok(()))))
        });
        let mut group = group();

        let outcome = execute_pass(&mut group, resolved(&handler), &settings()).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.requeue, Requeue::After(Duration::from_secs(60)));

        let ready = condition(&group, READY);
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason.as_deref(), Some("AtlasDeletionProtection"));
        assert!(condition(&group, "AuditingReady").is_true());
    }

    #[tokio::test]
    async fn test_domain_conditions_carry_generation() {
        let handler = ScriptedHandler::new(|_| {
            Ok(StateResult::next(LifecycleState::Created, "Group is created.")
                .with_condition(domain_condition(ProtectedDomain::Auditing, &Ok(())))
                .with_condition(domain_condition(
                    ProtectedDomain::IpAccessList,
                    &Err(OperatorError::DeletionProtection(ProtectedDomain::IpAccessList)),
                )))
        });
        let mut group = group();
        group.metadata.generation = Some(3);

        execute_pass(&mut group, resolved(&handler), &settings()).await;
        assert_eq!(condition(&group, "AuditingReady").observed_generation, Some(3));
        assert_eq!(condition(&group, "IPAccessListReady").observed_generation, Some(3));

        let first = group.status.clone();
        execute_pass(&mut group, resolved(&handler), &settings()).await;
        assert_eq!(group.status, first);
    }

    #[tokio::test]
    async fn test_cleared_condition_is_removed() {
        let mut group = group();
        let with_domain = ScriptedHandler::new(|_| {
            Ok(StateResult::next(LifecycleState::Created, "Group is created.")
                .with_condition(domain_condition(ProtectedDomain::Auditing, &Ok(()))))
        });
        execute_pass(&mut group, resolved(&with_domain), &settings()).await;
        assert!(conditions::find(group.conditions(), "AuditingReady").is_some());

        let clearing = ScriptedHandler::new(|_| {
            Ok(StateResult::unchanged(LifecycleState::Created).clearing("AuditingReady"))
        });
        execute_pass(&mut group, resolved(&clearing), &settings()).await;
        assert!(conditions::find(group.conditions(), "AuditingReady").is_none());
    }

    #[tokio::test]
    async fn test_generation_kept_while_creating() {
        let handler = ScriptedHandler::new(|state| {
            Ok(match state {
                LifecycleState::Initial => StateResult::next(LifecycleState::Creating, "creating")
                    .requeue_after(Duration::from_secs(30)),
                _ => StateResult::next(LifecycleState::Created, "Group is created."),
            })
        });
        let mut group = group();

        let outcome = execute_pass(&mut group, resolved(&handler), &settings()).await;
        assert_eq!(outcome.requeue, Requeue::After(Duration::from_secs(30)));

        group.metadata.generation = Some(2);
        execute_pass(&mut group, resolved(&handler), &settings()).await;
        assert_eq!(condition(&group, STATE).observed_generation, Some(1));
        assert_eq!(condition(&group, READY).observed_generation, Some(1));
    }

    #[test]
    fn test_reapply_period_annotation() {
        let default = Duration::from_secs(3600);
        let mut annotations = BTreeMap::new();
        assert_eq!(reapply_period(&annotations, default), default);

        annotations.insert(REAPPLY_PERIOD_ANNOTATION.to_string(), "30m".to_string());
        assert_eq!(reapply_period(&annotations, default), Duration::from_secs(1800));

        annotations.insert(REAPPLY_PERIOD_ANNOTATION.to_string(), "soon".to_string());
        assert_eq!(reapply_period(&annotations, default), default);
    }

    #[test]
    fn test_skip_annotation() {
        let mut annotations = BTreeMap::new();
        assert!(!is_skipped(&annotations));
        annotations.insert(RECONCILIATION_POLICY_ANNOTATION.to_string(), "skip".to_string());
        assert!(is_skipped(&annotations));
    }

    #[test]
    fn test_backoff_delay() {
        assert_eq!(backoff_delay(1), Duration::from_secs(5));
        assert_eq!(backoff_delay(2), Duration::from_secs(10));
        assert_eq!(backoff_delay(4), Duration::from_secs(40));
        assert_eq!(backoff_delay(20), Duration::from_secs(300));
    }
}
