//! Lifecycle states and the per-state handler contract

use crate::conditions;
use crate::crd::Condition;
use crate::dispatch::ApiVersion;
use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Lifecycle state of a managed resource, stored as the `State` condition reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Initial,
    ImportRequested,
    Imported,
    Creating,
    Created,
    Updating,
    Updated,
    DeletionRequested,
    Deleting,
    /// Terminal: the finalizer is released and no status is written
    Deleted,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Initial => "Initial",
            LifecycleState::ImportRequested => "ImportRequested",
            LifecycleState::Imported => "Imported",
            LifecycleState::Creating => "Creating",
            LifecycleState::Created => "Created",
            LifecycleState::Updating => "Updating",
            LifecycleState::Updated => "Updated",
            LifecycleState::DeletionRequested => "DeletionRequested",
            LifecycleState::Deleting => "Deleting",
            LifecycleState::Deleted => "Deleted",
        }
    }

    /// The external resource matches the spec
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            LifecycleState::Imported | LifecycleState::Created | LifecycleState::Updated
        )
    }

    /// Transitions that keep the previous observed generation
    fn preserves_generation(from: LifecycleState, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (from, to),
            (Creating, Creating)
                | (Creating, Created)
                | (Updating, Updating)
                | (Updating, Updated)
                | (DeletionRequested, Deleting)
                | (Deleting, Deleting)
                | (Deleting, Deleted)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "Initial" => LifecycleState::Initial,
            "ImportRequested" => LifecycleState::ImportRequested,
            "Imported" => LifecycleState::Imported,
            "Creating" => LifecycleState::Creating,
            "Created" => LifecycleState::Created,
            "Updating" => LifecycleState::Updating,
            "Updated" => LifecycleState::Updated,
            "DeletionRequested" => LifecycleState::DeletionRequested,
            "Deleting" => LifecycleState::Deleting,
            "Deleted" => LifecycleState::Deleted,
            other => return Err(format!("unknown state {:?}", other)),
        })
    }
}

/// State recorded in the `State` condition, `Initial` when absent
pub fn current_state(conditions: &[Condition]) -> LifecycleState {
    conditions::find(conditions, conditions::STATE)
        .and_then(|c| c.reason.as_deref())
        .and_then(|reason| reason.parse().ok())
        .unwrap_or(LifecycleState::Initial)
}

/// Observed generation to stamp on the conditions of this pass
pub fn observed_generation(
    generation: Option<i64>,
    previous: &[Condition],
    next: LifecycleState,
) -> Option<i64> {
    let Some(prev) = conditions::find(previous, conditions::STATE) else {
        return generation;
    };
    if LifecycleState::preserves_generation(current_state(previous), next) {
        prev.observed_generation
    } else {
        generation
    }
}

/// Outcome of one state callback
#[derive(Debug, Clone, PartialEq)]
pub struct StateResult {
    pub next_state: LifecycleState,
    /// Message of the `State` condition; `None` keeps the previous one
    pub message: Option<String>,
    pub requeue_after: Option<Duration>,
    /// Domain conditions to merge
    pub conditions: Vec<Condition>,
    /// Domain condition types to drop
    pub cleared: Vec<String>,
}

impl StateResult {
    pub fn next(state: LifecycleState, message: impl Into<String>) -> Self {
        Self {
            next_state: state,
            message: Some(message.into()),
            requeue_after: None,
            conditions: Vec::new(),
            cleared: Vec::new(),
        }
    }

    /// Stay in `state` without touching the state message
    pub fn unchanged(state: LifecycleState) -> Self {
        Self {
            message: None,
            ..Self::next(state, String::new())
        }
    }

    pub fn requeue_after(mut self, delay: Duration) -> Self {
        self.requeue_after = Some(delay);
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn clearing(mut self, condition_type: impl Into<String>) -> Self {
        self.cleared.push(condition_type.into());
        self
    }
}

/// Per-state callbacks of a version-specific handler.
///
/// The reconciler calls exactly one method per pass and applies whatever
/// next state it returns; transitions are owned by the handler.
#[async_trait]
pub trait StateHandler<K>: Send + Sync {
    /// Version this handler is bound to
    fn version(&self) -> ApiVersion;

    async fn handle_initial(&self, obj: &mut K) -> Result<StateResult>;

    async fn handle_import_requested(&self, obj: &mut K) -> Result<StateResult>;

    async fn handle_imported(&self, obj: &mut K) -> Result<StateResult>;

    async fn handle_creating(&self, obj: &mut K) -> Result<StateResult>;

    async fn handle_created(&self, obj: &mut K) -> Result<StateResult>;

    async fn handle_updating(&self, obj: &mut K) -> Result<StateResult>;

    async fn handle_updated(&self, obj: &mut K) -> Result<StateResult>;

    async fn handle_deletion_requested(&self, obj: &mut K) -> Result<StateResult>;

    async fn handle_deleting(&self, obj: &mut K) -> Result<StateResult>;
}

/// Invoke the callback bound to `state`
pub async fn dispatch_state<K: Send>(
    handler: &dyn StateHandler<K>,
    state: LifecycleState,
    obj: &mut K,
) -> Result<StateResult> {
    match state {
        LifecycleState::Initial => handler.handle_initial(obj).await,
        LifecycleState::ImportRequested => handler.handle_import_requested(obj).await,
        LifecycleState::Imported => handler.handle_imported(obj).await,
        LifecycleState::Creating => handler.handle_creating(obj).await,
        LifecycleState::Created => handler.handle_created(obj).await,
        LifecycleState::Updating => handler.handle_updating(obj).await,
        LifecycleState::Updated => handler.handle_updated(obj).await,
        LifecycleState::DeletionRequested => handler.handle_deletion_requested(obj).await,
        LifecycleState::Deleting => handler.handle_deleting(obj).await,
        LifecycleState::Deleted => Ok(StateResult::next(LifecycleState::Deleted, "Deleted")),
    }
}
