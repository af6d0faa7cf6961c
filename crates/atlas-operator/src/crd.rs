//! Custom Resource Definitions for the Atlas operator
//!
//! Every managed kind follows the same layout: an optional
//! `connectionSecretRef` next to a set of mutually exclusive version blocks,
//! one per Atlas Admin API version the kind can be reconciled with. Exactly
//! one block must be populated; the dispatcher picks the handler from it.
//!
//! Status carries the generic `State`/`Ready` conditions, the domain
//! conditions of the kind, a state tracker hash and one observed block per
//! version.

use crate::dispatch::ApiVersion;
use crate::error::Result;
use crate::indexer::{opt, req, ReferenceField, Referrer, Segment, TargetKind};
use crate::protection::DomainItems;
use kube::core::NamespaceResourceScope;
use kube::{CustomResource, Resource};
use regex::Regex;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group of all operator kinds
pub const API_GROUP: &str = "atlas.generated.mongodb.com";

/// API version of all operator kinds
pub const API_VERSION: &str = "v1";

/// Atlas organization ids are 24 hex characters
static ORG_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{24}$").unwrap());

/// Database user roles and custom role names
static ROLE_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_\-]{1,64}$").unwrap());

fn validate_org_id(value: &str) -> std::result::Result<(), ValidationError> {
    if ORG_ID_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_org_id")
            .with_message(format!("'{}' is not a valid Atlas organization id", value).into()))
    }
}

fn validate_role_name(value: &str) -> std::result::Result<(), ValidationError> {
    if ROLE_NAME_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_role_name")
            .with_message(format!("'{}' is not a valid role name", value).into()))
    }
}

fn validate_access_entry(entry: &IpAccessEntry) -> std::result::Result<(), ValidationError> {
    let set = [
        entry.cidr_block.is_some(),
        entry.ip_address.is_some(),
        entry.aws_security_group.is_some(),
    ]
    .iter()
    .filter(|s| **s)
    .count();
    if set != 1 {
        return Err(ValidationError::new("invalid_access_entry").with_message(
            "exactly one of cidrBlock, ipAddress or awsSecurityGroup must be set".into(),
        ));
    }
    if let Some(cidr) = &entry.cidr_block {
        let valid = cidr
            .split_once('/')
            .map(|(ip, prefix)| {
                ip.parse::<std::net::IpAddr>().is_ok() && prefix.parse::<u8>().is_ok_and(|p| p <= 128)
            })
            .unwrap_or(false);
        if !valid {
            return Err(ValidationError::new("invalid_cidr")
                .with_message(format!("'{}' is not a valid CIDR block", cidr).into()));
        }
    }
    if let Some(ip) = &entry.ip_address {
        if ip.parse::<std::net::IpAddr>().is_err() {
            return Err(ValidationError::new("invalid_ip")
                .with_message(format!("'{}' is not a valid IP address", ip).into()));
        }
    }
    Ok(())
}

fn validate_access_list(entries: &[IpAccessEntry]) -> std::result::Result<(), ValidationError> {
    entries.iter().try_for_each(validate_access_entry)
}

/// Status of a condition
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Condition reported in a resource status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (Ready, State, IPAccessListReady, ...)
    #[serde(rename = "type")]
    pub condition_type: String,

    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn new(
        condition_type: impl Into<String>,
        status: ConditionStatus,
        reason: Option<&str>,
        message: Option<String>,
    ) -> Self {
        Self {
            condition_type: condition_type.into(),
            status,
            reason: reason.map(str::to_string),
            message,
            observed_generation: None,
            last_transition_time: None,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Reference to an object in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LocalObjectReference {
    pub name: String,
}

impl LocalObjectReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Key/value tag attached to an Atlas resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Validate)]
pub struct ResourceTag {
    #[validate(length(min = 1, max = 255, message = "tag key must be 1-255 characters"))]
    pub key: String,
    #[validate(length(min = 1, max = 255, message = "tag value must be 1-255 characters"))]
    pub value: String,
}

/// Behaviour shared by every kind driven by the state reconciler
pub trait AtlasResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Referrer
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    type Status: Clone + Debug + Default + PartialEq + Serialize + Send + Sync;

    fn status_ref(&self) -> Option<&Self::Status>;

    fn status_mut(&mut self) -> &mut Self::Status;

    fn conditions(&self) -> &[Condition];

    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    /// Version blocks populated on the spec, in declaration order
    fn populated_versions(&self) -> Vec<ApiVersion>;

    fn connection_secret_ref(&self) -> Option<&LocalObjectReference>;

    /// Field-level validation of the spec
    fn validate_spec(&self) -> Result<()>;
}

/// Atlas project
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[kube(
    group = "atlas.generated.mongodb.com",
    version = "v1",
    kind = "Group",
    plural = "groups",
    shortname = "ag",
    namespaced,
    status = "GroupStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.conditions[?(@.type==\"State\")].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GroupSpec {
    /// Credentials secret in the same namespace; the global secret is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_secret_ref: Option<LocalObjectReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub v20231115: Option<GroupV20231115>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub v20250312: Option<GroupV20250312>,
}

/// Group shaped for the 2023-11-15 Admin API
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GroupV20231115 {
    #[validate(length(min = 1, max = 64, message = "name must be 1-64 characters"))]
    pub name: String,

    #[validate(custom(function = "validate_org_id"))]
    pub org_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_default_alerts_settings: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[validate(nested)]
    pub tags: Vec<ResourceTag>,
}

/// Group shaped for the 2025-03-12 Admin API, including project sub-resources
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GroupV20250312 {
    #[validate(length(min = 1, max = 64, message = "name must be 1-64 characters"))]
    pub name: String,

    #[validate(custom(function = "validate_org_id"))]
    pub org_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_default_alerts_settings: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_usage_restrictions: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[validate(nested)]
    pub tags: Vec<ResourceTag>,

    /// Unset leaves the access list unmanaged; an empty list removes every entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_access_list"))]
    pub ip_access_list: Option<Vec<IpAccessEntry>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub maintenance_window: Option<MaintenanceWindow>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub custom_roles: Option<Vec<CustomRole>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teams: Option<Vec<TeamAssignment>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrations: Option<Vec<Integration>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auditing: Option<Auditing>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<ProjectSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_at_rest: Option<EncryptionAtRest>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IpAccessEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr_block: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_security_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_after_date: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceWindow {
    /// 1 (Sunday) to 7 (Saturday)
    #[validate(range(min = 1, max = 7, message = "dayOfWeek must be between 1 and 7"))]
    pub day_of_week: i32,
    #[validate(range(min = 0, max = 23, message = "hourOfDay must be between 0 and 23"))]
    pub hour_of_day: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_defer_once_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_asap: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CustomRole {
    #[validate(custom(function = "validate_role_name"))]
    pub role_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<RoleAction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inherited_roles: Vec<InheritedRole>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoleAction {
    pub action: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ActionResource>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct InheritedRole {
    pub role: String,
    pub db: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TeamAssignment {
    pub team_id: String,
    pub role_names: Vec<String>,
}

/// Third-party integration; secret values are read from `credentials`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Integration {
    #[serde(rename = "type")]
    pub integration_type: String,
    /// Non-secret settings sent as-is (channelName, region, url, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<IntegrationCredential>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationCredential {
    /// Request field receiving the secret value (apiToken, serviceKey, ...)
    pub field: String,
    pub secret_ref: LocalObjectReference,
    /// Key inside the secret
    #[serde(default = "default_secret_key")]
    pub key: String,
}

fn default_secret_key() -> String {
    "password".to_string()
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Auditing {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_authorization_success: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_collect_database_specifics_statistics_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_data_explorer_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_performance_advisor_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_realtime_performance_panel_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_schema_advisor_enabled: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionAtRest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_kms: Option<AwsKms>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_cloud_kms: Option<GoogleCloudKms>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AwsKms {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_master_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_id: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GoogleCloudKms {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_version_resource_id: Option<String>,
}

/// Observed state of a Group
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Hash of the last applied spec and its dependencies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_tracker: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v20231115: Option<GroupObserved>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v20250312: Option<GroupObserved>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupObserved {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_count: Option<i64>,
    /// Last applied items per domain condition type, as canonical JSON
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub applied_domains: BTreeMap<String, String>,
}

impl GroupObserved {
    /// Items last applied for a domain
    pub fn applied(&self, condition_type: &str) -> DomainItems {
        self.applied_domains
            .get(condition_type)
            .and_then(|raw| serde_json::from_str::<DomainItems>(raw).ok())
            .unwrap_or_default()
    }
}

impl Group {
    /// Atlas id from whichever observed block is set
    pub fn atlas_id(&self) -> Option<&str> {
        let status = self.status.as_ref()?;
        status
            .v20250312
            .as_ref()
            .and_then(|o| o.id.as_deref())
            .or_else(|| status.v20231115.as_ref().and_then(|o| o.id.as_deref()))
    }
}

static GROUP_REFERENCES: [ReferenceField; 2] = [
    ReferenceField {
        index: "group.connectionSecretRef",
        path: &[opt("connectionSecretRef")],
        target: TargetKind::SECRET,
    },
    ReferenceField {
        index: "group.v20250312.integrations.credentials.secretRef",
        path: &[
            opt("v20250312"),
            opt("integrations"),
            Segment::Each,
            opt("credentials"),
            Segment::Each,
            req("secretRef"),
        ],
        target: TargetKind::SECRET,
    },
];

impl Referrer for Group {
    fn reference_fields() -> &'static [ReferenceField] {
        &GROUP_REFERENCES
    }
}

impl AtlasResource for Group {
    type Status = GroupStatus;

    fn status_ref(&self) -> Option<&GroupStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut GroupStatus {
        self.status.get_or_insert_with(GroupStatus::default)
    }

    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status_mut().conditions
    }

    fn populated_versions(&self) -> Vec<ApiVersion> {
        let mut versions = Vec::new();
        if self.spec.v20231115.is_some() {
            versions.push(ApiVersion::V20231115);
        }
        if self.spec.v20250312.is_some() {
            versions.push(ApiVersion::V20250312);
        }
        versions
    }

    fn connection_secret_ref(&self) -> Option<&LocalObjectReference> {
        self.spec.connection_secret_ref.as_ref()
    }

    fn validate_spec(&self) -> Result<()> {
        self.spec.validate()?;
        Ok(())
    }
}

/// Atlas database user
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[kube(
    group = "atlas.generated.mongodb.com",
    version = "v1",
    kind = "DatabaseUser",
    plural = "databaseusers",
    shortname = "adu",
    namespaced,
    status = "DatabaseUserStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.conditions[?(@.type==\"State\")].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseUserSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_secret_ref: Option<LocalObjectReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub v20250312: Option<DatabaseUserV20250312>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseUserV20250312 {
    #[validate(length(min = 1, max = 1024, message = "username must be 1-1024 characters"))]
    pub username: String,

    /// Authentication database
    #[serde(default = "default_auth_database")]
    pub database_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[validate(nested)]
    pub roles: Vec<DatabaseRole>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<UserScope>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Group resource owning the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_ref: Option<LocalObjectReference>,

    /// Atlas id of a group not managed by this operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    /// Secret holding the password under the `password` key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret_ref: Option<LocalObjectReference>,
}

impl Default for DatabaseUserV20250312 {
    fn default() -> Self {
        Self {
            username: String::new(),
            database_name: default_auth_database(),
            roles: Vec::new(),
            scopes: Vec::new(),
            description: None,
            group_ref: None,
            group_id: None,
            password_secret_ref: None,
        }
    }
}

fn default_auth_database() -> String {
    "admin".to_string()
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseRole {
    #[validate(custom(function = "validate_role_name"))]
    pub role_name: String,
    pub database_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct UserScope {
    pub name: String,
    #[serde(rename = "type")]
    pub scope_type: String,
}

/// Observed state of a DatabaseUser
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseUserStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_tracker: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v20250312: Option<DatabaseUserObserved>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseUserObserved {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
}

static DATABASE_USER_REFERENCES: [ReferenceField; 3] = [
    ReferenceField {
        index: "databaseuser.connectionSecretRef",
        path: &[opt("connectionSecretRef")],
        target: TargetKind::SECRET,
    },
    ReferenceField {
        index: "databaseuser.v20250312.groupRef",
        path: &[opt("v20250312"), opt("groupRef")],
        target: TargetKind::GROUP,
    },
    ReferenceField {
        index: "databaseuser.v20250312.passwordSecretRef",
        path: &[opt("v20250312"), opt("passwordSecretRef")],
        target: TargetKind::SECRET,
    },
];

impl Referrer for DatabaseUser {
    fn reference_fields() -> &'static [ReferenceField] {
        &DATABASE_USER_REFERENCES
    }
}

impl AtlasResource for DatabaseUser {
    type Status = DatabaseUserStatus;

    fn status_ref(&self) -> Option<&DatabaseUserStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut DatabaseUserStatus {
        self.status.get_or_insert_with(DatabaseUserStatus::default)
    }

    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status_mut().conditions
    }

    fn populated_versions(&self) -> Vec<ApiVersion> {
        self.spec
            .v20250312
            .iter()
            .map(|_| ApiVersion::V20250312)
            .collect()
    }

    fn connection_secret_ref(&self) -> Option<&LocalObjectReference> {
        self.spec.connection_secret_ref.as_ref()
    }

    fn validate_spec(&self) -> Result<()> {
        self.spec.validate()?;
        if let Some(v) = &self.spec.v20250312 {
            match (&v.group_ref, &v.group_id) {
                (Some(_), Some(_)) => {
                    return Err(crate::error::OperatorError::Validation(
                        "only one of groupRef or groupId may be set".to_string(),
                    ))
                }
                (None, None) => {
                    return Err(crate::error::OperatorError::Validation(
                        "one of groupRef or groupId must be set".to_string(),
                    ))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn v20231115() -> GroupV20231115 {
        GroupV20231115 {
            name: "my-project".to_string(),
            org_id: "5f1b5c4e8f1b2c3d4e5f6a7b".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_group_crd_generation() {
        let crd = Group::crd();
        assert_eq!(crd.spec.group, API_GROUP);
        assert_eq!(crd.spec.names.kind, "Group");
        assert_eq!(crd.spec.names.plural, "groups");
    }

    #[test]
    fn test_populated_versions() {
        let mut group = Group::new("g", GroupSpec::default());
        assert!(group.populated_versions().is_empty());

        group.spec.v20231115 = Some(v20231115());
        assert_eq!(group.populated_versions(), vec![ApiVersion::V20231115]);

        group.spec.v20250312 = Some(GroupV20250312::default());
        assert_eq!(group.populated_versions().len(), 2);
    }

    #[test]
    fn test_group_validation() {
        let mut group = Group::new(
            "g",
            GroupSpec {
                v20231115: Some(v20231115()),
                ..Default::default()
            },
        );
        assert!(group.validate_spec().is_ok());

        if let Some(v) = group.spec.v20231115.as_mut() {
            v.org_id = "not-an-org".to_string();
        }
        let err = group.validate_spec().unwrap_err();
        assert!(err.to_string().contains("organization id"));
    }

    #[test]
    fn test_access_list_validation() {
        let entry = |cidr: &str| IpAccessEntry {
            cidr_block: Some(cidr.to_string()),
            ..Default::default()
        };
        assert!(validate_access_list(&[entry("10.0.0.0/24")]).is_ok());
        assert!(validate_access_list(&[entry("10.0.0.0")]).is_err());
        assert!(validate_access_list(&[IpAccessEntry::default()]).is_err());
    }

    #[test]
    fn test_database_user_group_exclusivity() {
        let mut user = DatabaseUser::new(
            "u",
            DatabaseUserSpec {
                connection_secret_ref: None,
                v20250312: Some(DatabaseUserV20250312 {
                    username: "app".to_string(),
                    ..Default::default()
                }),
            },
        );
        assert!(user.validate_spec().is_err());

        if let Some(v) = user.spec.v20250312.as_mut() {
            v.group_id = Some("65f1b5c4e8f1b2c3d4e5f6a7".to_string());
        }
        assert!(user.validate_spec().is_ok());

        if let Some(v) = user.spec.v20250312.as_mut() {
            v.group_ref = Some(LocalObjectReference::new("group-a"));
        }
        assert!(user.validate_spec().is_err());
    }

    #[test]
    fn test_condition_serialization() {
        let cond = Condition::new("Ready", ConditionStatus::True, Some("Settled"), None);
        let json = serde_json::to_value(&cond).unwrap();
        assert_eq!(json["type"], "Ready");
        assert_eq!(json["status"], "True");
        assert!(json.get("message").is_none());
    }
}
