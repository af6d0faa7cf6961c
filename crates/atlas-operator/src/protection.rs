//! Deletion protection
//!
//! Two independent policies live here:
//!
//! - **Object deletion protection** decides whether deleting a custom resource
//!   also deletes the Atlas object behind it. It can be overridden per object
//!   with the `mongodb.com/atlas-resource-policy` annotation.
//! - **Sub-object deletion protection** gates writes inside a parent resource
//!   (IP access entries, custom roles, integrations, ...). Each domain is
//!   diffed against what Atlas reports and a write that would discard state
//!   the spec does not re-declare is refused.
//!
//! Drift detection is a pure function over JSON items so it can be tested
//! without talking to Atlas.

use crate::crd::{Condition, ConditionStatus};
use crate::error::{OperatorError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use tracing::warn;

/// Condition reason used when the guard refuses a write
pub const DELETION_PROTECTION_REASON: &str = "AtlasDeletionProtection";

/// Documentation link embedded in every protection message
pub const DELETION_PROTECTION_DOC: &str = "https://dochub.mongodb.org/core/ako-deletion-protection";

/// Annotation overriding object deletion protection
pub const RESOURCE_POLICY_ANNOTATION: &str = "mongodb.com/atlas-resource-policy";

/// Items of one domain keyed by their natural identifier
pub type DomainItems = BTreeMap<String, Value>;

/// Key used for domains holding a single configuration object
pub const SINGLE_ITEM_KEY: &str = "config";

/// A protected configuration domain of a parent resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtectedDomain {
    IpAccessList,
    CloudProviderAccess,
    NetworkPeering,
    Integrations,
    MaintenanceWindow,
    Auditing,
    Settings,
    EncryptionAtRest,
    CustomRoles,
    TeamAssignment,
}

impl ProtectedDomain {
    /// Every domain the guard knows about
    pub const ALL: [ProtectedDomain; 10] = [
        ProtectedDomain::IpAccessList,
        ProtectedDomain::CloudProviderAccess,
        ProtectedDomain::NetworkPeering,
        ProtectedDomain::Integrations,
        ProtectedDomain::MaintenanceWindow,
        ProtectedDomain::Auditing,
        ProtectedDomain::Settings,
        ProtectedDomain::EncryptionAtRest,
        ProtectedDomain::CustomRoles,
        ProtectedDomain::TeamAssignment,
    ];

    /// Name used inside the protection message
    pub fn display_name(&self) -> &'static str {
        match self {
            ProtectedDomain::IpAccessList => "IP Access List",
            ProtectedDomain::CloudProviderAccess => "Cloud Provider Integrations",
            ProtectedDomain::NetworkPeering => "Network Peering",
            ProtectedDomain::Integrations => "Integrations",
            ProtectedDomain::MaintenanceWindow => "Maintenance Window",
            ProtectedDomain::Auditing => "Auditing",
            ProtectedDomain::Settings => "Project Settings",
            ProtectedDomain::EncryptionAtRest => "Encryption At Rest",
            ProtectedDomain::CustomRoles => "Custom Roles",
            ProtectedDomain::TeamAssignment => "Assigned Teams",
        }
    }

    /// Condition type reporting this domain
    pub fn condition_type(&self) -> &'static str {
        match self {
            ProtectedDomain::IpAccessList => "IPAccessListReady",
            ProtectedDomain::CloudProviderAccess => "CloudProviderIntegrationReady",
            ProtectedDomain::NetworkPeering => "NetworkPeerReady",
            ProtectedDomain::Integrations => "IntegrationReady",
            ProtectedDomain::MaintenanceWindow => "MaintenanceWindowReady",
            ProtectedDomain::Auditing => "AuditingReady",
            ProtectedDomain::Settings => "ProjectSettingsReady",
            ProtectedDomain::EncryptionAtRest => "EncryptionAtRestReady",
            ProtectedDomain::CustomRoles => "ProjectCustomRolesReady",
            ProtectedDomain::TeamAssignment => "ProjectTeamsReady",
        }
    }

    /// Stable message reported when the guard blocks this domain.
    ///
    /// Automation parses this string; changing the wording is a breaking change.
    pub fn protection_message(&self) -> String {
        format!(
            "unable to reconcile {} due to deletion protection being enabled. see {} for further information",
            self.display_name(),
            DELETION_PROTECTION_DOC
        )
    }
}

impl std::fmt::Display for ProtectedDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// How an observed item would be affected by applying the desired spec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftChange {
    /// The item is not declared and would be deleted
    Removal,
    /// The item is declared with different values and would be overwritten
    Overwrite,
}

/// One externally-provisioned item the desired spec would discard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainConflict {
    pub domain: ProtectedDomain,
    pub key: String,
    pub change: DriftChange,
}

/// Diff a domain's desired items against what Atlas reports.
///
/// An observed item is accounted for when it is still unset (see
/// [`is_unset`]), when the desired item with the same key is a field-wise
/// subset of it, or when the item this operator last applied under that key
/// still matches it. Everything else would be removed or overwritten by
/// applying `desired` and is reported as a conflict.
pub fn detect_destructive_drift(
    domain: ProtectedDomain,
    desired: &DomainItems,
    observed: &DomainItems,
    last_applied: &DomainItems,
) -> Vec<DomainConflict> {
    observed
        .iter()
        .filter(|(_, actual)| !is_unset(actual))
        .filter_map(|(key, actual)| {
            let wanted = desired.get(key);
            if wanted.is_some_and(|w| is_subset(w, actual)) {
                return None;
            }
            if last_applied.get(key).is_some_and(|l| is_subset(l, actual)) {
                return None;
            }
            Some(DomainConflict {
                domain,
                key: key.clone(),
                change: if wanted.is_some() {
                    DriftChange::Overwrite
                } else {
                    DriftChange::Removal
                },
            })
        })
        .collect()
}

/// Whether an Atlas value still holds nothing a user configured.
///
/// Nulls, `false`, zero, empty strings and empty collections are unset. An
/// object is unset when all of its fields are, or when it is switched off
/// with `enabled: false` (auditing, KMS providers).
pub fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => {
            fields.get("enabled") == Some(&Value::Bool(false)) || fields.values().all(is_unset)
        }
    }
}

/// Whether every field set in `wanted` has the same value in `actual`.
///
/// Nulls in `wanted` mean "unset" and match anything. Arrays match when they
/// have the same length and every wanted element matches a distinct actual
/// element, regardless of order.
pub fn is_subset(wanted: &Value, actual: &Value) -> bool {
    match (wanted, actual) {
        (Value::Null, _) => true,
        (Value::Object(w), Value::Object(a)) => w
            .iter()
            .all(|(k, v)| v.is_null() || a.get(k).is_some_and(|av| is_subset(v, av))),
        (Value::Array(w), Value::Array(a)) => {
            if w.len() != a.len() {
                return false;
            }
            let mut used = vec![false; a.len()];
            w.iter().all(|wv| {
                let hit = a
                    .iter()
                    .enumerate()
                    .find(|(i, av)| !used[*i] && is_subset(wv, av));
                match hit {
                    Some((i, _)) => {
                        used[i] = true;
                        true
                    }
                    None => false,
                }
            })
        }
        (Value::Number(w), Value::Number(a)) => w.as_f64() == a.as_f64(),
        _ => wanted == actual,
    }
}

/// Key a list of JSON items by the first present identifier field
pub fn items_by_key(values: &[Value], key_fields: &[&str]) -> DomainItems {
    values
        .iter()
        .filter_map(|value| {
            key_fields
                .iter()
                .find_map(|field| value.get(*field).and_then(Value::as_str))
                .map(|key| (key.to_string(), value.clone()))
        })
        .collect()
}

/// Wrap a single configuration object as domain items
pub fn single_item(value: Option<&Value>) -> DomainItems {
    value
        .filter(|v| !v.is_null())
        .map(|v| BTreeMap::from([(SINGLE_ITEM_KEY.to_string(), v.clone())]))
        .unwrap_or_default()
}

/// Gate for writes inside protected domains
#[derive(Debug, Clone, Copy)]
pub struct DeletionProtectionGuard {
    enabled: bool,
}

impl DeletionProtectionGuard {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Run `action` unless protection is on and `conflicts` is non-empty.
    ///
    /// A refused write never reaches Atlas; the caller reports the returned
    /// error on the domain's condition.
    pub async fn guard<F, Fut, T>(
        &self,
        domain: ProtectedDomain,
        conflicts: &[DomainConflict],
        action: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.enabled && !conflicts.is_empty() {
            let keys: Vec<&str> = conflicts.iter().map(|c| c.key.as_str()).collect();
            warn!(
                domain = domain.display_name(),
                conflicts = ?keys,
                "Refusing write blocked by deletion protection"
            );
            metrics::counter!(
                "atlas_operator_deletion_protection_blocks_total",
                "domain" => domain.condition_type()
            )
            .increment(1);
            return Err(OperatorError::DeletionProtection(domain));
        }
        action().await
    }
}

/// Condition describing the outcome of reconciling one domain
pub fn domain_condition(domain: ProtectedDomain, outcome: &Result<()>) -> Condition {
    match outcome {
        Ok(()) => Condition::new(domain.condition_type(), ConditionStatus::True, None, None),
        Err(e) => Condition::new(
            domain.condition_type(),
            ConditionStatus::False,
            Some(e.ready_reason()),
            Some(e.to_string()),
        ),
    }
}

/// Object-level policy from the resource-policy annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourcePolicy {
    Keep,
    Delete,
}

impl ResourcePolicy {
    /// Parse the annotation value, ignoring unknown values
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Option<Self> {
        match annotations.get(RESOURCE_POLICY_ANNOTATION).map(String::as_str) {
            Some("keep") => Some(ResourcePolicy::Keep),
            Some("delete") => Some(ResourcePolicy::Delete),
            _ => None,
        }
    }
}

/// Whether the Atlas object must survive deletion of its custom resource
pub fn keep_on_delete(annotations: &BTreeMap<String, String>, protection_enabled: bool) -> bool {
    match ResourcePolicy::from_annotations(annotations) {
        Some(ResourcePolicy::Keep) => true,
        Some(ResourcePolicy::Delete) => false,
        None => protection_enabled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn access_list(entries: &[Value]) -> DomainItems {
        items_by_key(entries, &["cidrBlock", "ipAddress"])
    }

    #[test]
    fn test_messages_are_stable() {
        assert_eq!(
            ProtectedDomain::CustomRoles.protection_message(),
            "unable to reconcile Custom Roles due to deletion protection being enabled. \
             see https://dochub.mongodb.org/core/ako-deletion-protection for further information"
        );
        assert_eq!(
            ProtectedDomain::TeamAssignment.condition_type(),
            "ProjectTeamsReady"
        );
        let mut types: Vec<_> = ProtectedDomain::ALL
            .iter()
            .map(|d| d.condition_type())
            .collect();
        types.sort();
        types.dedup();
        assert_eq!(types.len(), ProtectedDomain::ALL.len());
    }

    #[test]
    fn test_external_entry_not_redeclared_is_removal() {
        let observed = access_list(&[json!({"cidrBlock": "192.168.0.0/24", "groupId": "g1"})]);
        let desired = access_list(&[json!({"cidrBlock": "10.0.0.0/24"})]);

        let conflicts = detect_destructive_drift(
            ProtectedDomain::IpAccessList,
            &desired,
            &observed,
            &DomainItems::new(),
        );

        assert_eq!(
            conflicts,
            vec![DomainConflict {
                domain: ProtectedDomain::IpAccessList,
                key: "192.168.0.0/24".into(),
                change: DriftChange::Removal,
            }]
        );
    }

    #[test]
    fn test_matching_spec_has_no_conflict() {
        let observed = access_list(&[json!({
            "cidrBlock": "192.168.0.0/24",
            "comment": "office",
            "links": []
        })]);
        let desired = access_list(&[json!({"cidrBlock": "192.168.0.0/24", "comment": "office"})]);

        assert!(detect_destructive_drift(
            ProtectedDomain::IpAccessList,
            &desired,
            &observed,
            &DomainItems::new()
        )
        .is_empty());
    }

    #[test]
    fn test_operator_owned_items_may_change() {
        let observed = access_list(&[json!({"cidrBlock": "10.1.0.0/16", "comment": "old"})]);
        let applied = access_list(&[json!({"cidrBlock": "10.1.0.0/16", "comment": "old"})]);

        assert!(detect_destructive_drift(
            ProtectedDomain::IpAccessList,
            &DomainItems::new(),
            &observed,
            &applied
        )
        .is_empty());
    }

    #[test]
    fn test_single_item_overwrite() {
        let observed = single_item(Some(&json!({"dayOfWeek": 3, "hourOfDay": 4})));
        let desired = single_item(Some(&json!({"dayOfWeek": 5, "hourOfDay": 4})));

        let conflicts = detect_destructive_drift(
            ProtectedDomain::MaintenanceWindow,
            &desired,
            &observed,
            &DomainItems::new(),
        );
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].change, DriftChange::Overwrite);
    }

    #[test]
    fn test_unset_atlas_state_is_not_a_conflict() {
        let desired = single_item(Some(&json!({"enabled": true, "auditFilter": "{}"})));
        for fresh in [
            json!({"enabled": false}),
            json!({"enabled": false, "auditFilter": "{\"atype\":\"authenticate\"}"}),
            json!({}),
            json!({"dayOfWeek": 0, "hourOfDay": 0, "startASAP": false}),
            json!({
                "awsKms": {"enabled": false, "region": "US_EAST_1"},
                "azureKeyVault": {"enabled": false},
                "googleCloudKms": {}
            }),
        ] {
            let observed = single_item(Some(&fresh));
            assert!(
                detect_destructive_drift(
                    ProtectedDomain::Auditing,
                    &desired,
                    &observed,
                    &DomainItems::new()
                )
                .is_empty(),
                "{fresh} should not conflict"
            );
        }

        let configured = single_item(Some(&json!({"enabled": true, "auditFilter": "{\"atype\":\"authCheck\"}"})));
        assert_eq!(
            detect_destructive_drift(
                ProtectedDomain::Auditing,
                &desired,
                &configured,
                &DomainItems::new()
            )
            .len(),
            1
        );
        assert!(!is_unset(&json!({"awsKms": {"enabled": true}})));
    }

    #[test]
    fn test_is_subset_arrays_ignore_order() {
        assert!(is_subset(
            &json!({"roles": ["a", "b"]}),
            &json!({"roles": ["b", "a"], "extra": 1})
        ));
        assert!(!is_subset(&json!({"roles": ["a"]}), &json!({"roles": ["a", "b"]})));
        assert!(is_subset(&json!({"n": 1}), &json!({"n": 1.0})));
        assert!(is_subset(&json!({"unset": null}), &json!({})));
    }

    #[tokio::test]
    async fn test_guard_blocks_without_calling_action() {
        let calls = AtomicUsize::new(0);
        let conflict = DomainConflict {
            domain: ProtectedDomain::IpAccessList,
            key: "192.168.0.0/24".into(),
            change: DriftChange::Removal,
        };

        let guard = DeletionProtectionGuard::new(true);
        let result = guard
            .guard(ProtectedDomain::IpAccessList, &[conflict.clone()], || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(OperatorError::DeletionProtection(ProtectedDomain::IpAccessList))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let open = DeletionProtectionGuard::new(false);
        open.guard(ProtectedDomain::IpAccessList, &[conflict], || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_domain_condition() {
        let blocked = domain_condition(
            ProtectedDomain::IpAccessList,
            &Err(OperatorError::DeletionProtection(ProtectedDomain::IpAccessList)),
        );
        assert_eq!(blocked.condition_type, "IPAccessListReady");
        assert_eq!(blocked.status, ConditionStatus::False);
        assert_eq!(blocked.reason.as_deref(), Some(DELETION_PROTECTION_REASON));
        assert_eq!(
            blocked.message,
            Some(ProtectedDomain::IpAccessList.protection_message())
        );

        let ok = domain_condition(ProtectedDomain::Auditing, &Ok(()));
        assert_eq!(ok.status, ConditionStatus::True);
    }

    #[test]
    fn test_keep_on_delete() {
        let mut annotations = BTreeMap::new();
        assert!(keep_on_delete(&annotations, true));
        assert!(!keep_on_delete(&annotations, false));

        annotations.insert(RESOURCE_POLICY_ANNOTATION.to_string(), "delete".to_string());
        assert!(!keep_on_delete(&annotations, true));

        annotations.insert(RESOURCE_POLICY_ANNOTATION.to_string(), "keep".to_string());
        assert!(keep_on_delete(&annotations, false));

        annotations.insert(RESOURCE_POLICY_ANNOTATION.to_string(), "bogus".to_string());
        assert!(!keep_on_delete(&annotations, false));
    }
}
