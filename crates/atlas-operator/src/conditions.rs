//! Status condition helpers

use crate::crd::{Condition, ConditionStatus};
use crate::error::OperatorError;
use crate::state::LifecycleState;
use chrono::Utc;

/// Aggregate condition over the lifecycle state and every domain condition
pub const READY: &str = "Ready";

/// Condition whose reason carries the lifecycle state
pub const STATE: &str = "State";

pub const READY_REASON_PENDING: &str = "Pending";
pub const READY_REASON_SETTLED: &str = "Settled";
pub const READY_REASON_ERROR: &str = "Error";

/// Find a condition by type
pub fn find<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions
        .iter()
        .find(|c| c.condition_type == condition_type)
}

/// Insert or replace a condition by type.
///
/// `lastTransitionTime` only moves when the status flips, so re-applying an
/// unchanged condition leaves the list byte-for-byte identical.
pub fn set(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            } else if condition.last_transition_time.is_none() {
                condition.last_transition_time = Some(Utc::now().to_rfc3339());
            }
            *existing = condition;
        }
        None => {
            if condition.last_transition_time.is_none() {
                condition.last_transition_time = Some(Utc::now().to_rfc3339());
            }
            conditions.push(condition);
        }
    }
}

/// Remove a condition by type
pub fn remove(conditions: &mut Vec<Condition>, condition_type: &str) {
    conditions.retain(|c| c.condition_type != condition_type);
}

/// Ready condition implied by the next lifecycle state alone
pub fn ready_for_state(state: LifecycleState) -> Condition {
    let (status, reason, message) = match state {
        LifecycleState::Initial => (
            ConditionStatus::False,
            READY_REASON_PENDING,
            "Resource is in initial state.",
        ),
        LifecycleState::ImportRequested => (
            ConditionStatus::False,
            READY_REASON_PENDING,
            "Resource is being imported.",
        ),
        LifecycleState::Creating
        | LifecycleState::Updating
        | LifecycleState::DeletionRequested
        | LifecycleState::Deleting => (
            ConditionStatus::False,
            READY_REASON_PENDING,
            "Resource is pending.",
        ),
        LifecycleState::Imported => (
            ConditionStatus::True,
            READY_REASON_SETTLED,
            "Resource is imported.",
        ),
        LifecycleState::Created | LifecycleState::Updated => (
            ConditionStatus::True,
            READY_REASON_SETTLED,
            "Resource is settled.",
        ),
        LifecycleState::Deleted => (
            ConditionStatus::False,
            READY_REASON_PENDING,
            "Resource is deleted.",
        ),
    };
    Condition::new(READY, status, Some(reason), Some(message.to_string()))
}

/// Ready condition for a finished pass.
///
/// An error wins; otherwise a settled state is only Ready when every domain
/// condition is True. Failing domains are listed sorted by type.
pub fn aggregate_ready(
    state: LifecycleState,
    error: Option<&OperatorError>,
    conditions: &[Condition],
) -> Condition {
    if let Some(err) = error {
        return Condition::new(
            READY,
            ConditionStatus::False,
            Some(err.ready_reason()),
            Some(err.to_string()),
        );
    }

    let ready = ready_for_state(state);
    if !ready.is_true() {
        return ready;
    }

    let mut failing: Vec<&Condition> = conditions
        .iter()
        .filter(|c| c.condition_type != READY && c.condition_type != STATE && !c.is_true())
        .collect();
    if failing.is_empty() {
        return ready;
    }
    failing.sort_by(|a, b| a.condition_type.cmp(&b.condition_type));

    let first_reason = failing[0].reason.as_deref();
    let reason = if failing.iter().all(|c| c.reason.as_deref() == first_reason) {
        first_reason.unwrap_or(READY_REASON_ERROR)
    } else {
        READY_REASON_ERROR
    };
    let message = failing
        .iter()
        .map(|c| match &c.message {
            Some(msg) => format!("{}: {}", c.condition_type, msg),
            None => format!("{} is not ready", c.condition_type),
        })
        .collect::<Vec<_>>()
        .join("; ");

    Condition::new(READY, ConditionStatus::False, Some(reason), Some(message))
}
