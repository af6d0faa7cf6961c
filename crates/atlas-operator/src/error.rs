//! Error types for the Atlas operator

use crate::atlas_client::ApiError;
use crate::protection::ProtectedDomain;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while reconciling Atlas resources
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Zero or several version blocks populated on a spec
    #[error("{0}")]
    SpecVersion(SpecVersionError),

    /// Spec is self-contradictory or fails field validation
    #[error("{0}")]
    Validation(String),

    /// A populated version has no translator compiled into this binary
    #[error("no translator registered for {kind} version {version}")]
    Translation { kind: String, version: String },

    /// Write refused by the deletion-protection guard
    #[error("{}", .0.protection_message())]
    DeletionProtection(ProtectedDomain),

    /// Credentials secret could not be found
    #[error("Secret \"{name}\" not found")]
    SecretNotFound { name: String },

    /// Credentials secret exists but is unusable
    #[error("invalid credentials in secret {secret}: {reason}")]
    InvalidCredentials { secret: String, reason: String },

    /// A referenced resource is not ready for this one yet
    #[error("{0}")]
    DependencyNotReady(String),

    /// Error returned by the Atlas Admin API
    #[error("{0}")]
    AtlasApi(#[from] ApiError),

    /// External write suppressed because the operator runs in dry-run mode
    #[error("dry run: {method} {path} not executed")]
    DryRun { method: String, path: String },

    /// Status could not be persisted because the object kept changing
    #[error("conflict persisting status for {0}")]
    Conflict(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Invalid operator configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why version selection failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecVersionError {
    None,
    Multiple,
}

impl std::fmt::Display for SpecVersionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpecVersionError::None => write!(
                f,
                "no resource spec version specified - please set one of the available spec versions"
            ),
            SpecVersionError::Multiple => write!(
                f,
                "multiple resource spec versions specified - please set only one spec version"
            ),
        }
    }
}

/// How the control loop treats an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Needs user action; report and retry at the fixed hold interval
    Hold,
    /// Network, rate limit, 5xx, conflicts; exponential backoff
    Transient,
    /// Programming-level failure; handed to the work queue's backoff
    Propagate,
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Classify the error for requeue purposes
    pub fn class(&self) -> ErrorClass {
        match self {
            OperatorError::SpecVersion(_)
            | OperatorError::Validation(_)
            | OperatorError::Translation { .. }
            | OperatorError::DeletionProtection(_)
            | OperatorError::SecretNotFound { .. }
            | OperatorError::InvalidCredentials { .. }
            | OperatorError::DependencyNotReady(_)
            | OperatorError::DryRun { .. }
            | OperatorError::InvalidConfig(_) => ErrorClass::Hold,
            OperatorError::AtlasApi(e) if e.is_transient() => ErrorClass::Transient,
            OperatorError::AtlasApi(_) => ErrorClass::Hold,
            OperatorError::KubeError(_) | OperatorError::Conflict(_) | OperatorError::Timeout(_) => {
                ErrorClass::Transient
            }
            OperatorError::SerializationError(_) | OperatorError::Internal(_) => {
                ErrorClass::Propagate
            }
        }
    }

    /// Check if this error is retryable with backoff
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Fixed requeue delay for errors that wait on the user
    pub fn requeue_delay(&self, hold: Duration) -> Option<Duration> {
        match self.class() {
            ErrorClass::Hold => Some(hold),
            _ => None,
        }
    }

    /// Reason used on the `Ready` condition when a pass fails with this error
    pub fn ready_reason(&self) -> &'static str {
        match self {
            OperatorError::SpecVersion(SpecVersionError::None) => "NoSpecVersion",
            OperatorError::SpecVersion(SpecVersionError::Multiple) => "MultipleSpecVersions",
            OperatorError::Validation(_) => "ValidationFailed",
            OperatorError::Translation { .. } => "TranslationError",
            OperatorError::DeletionProtection(_) => crate::protection::DELETION_PROTECTION_REASON,
            OperatorError::SecretNotFound { .. } | OperatorError::InvalidCredentials { .. } => {
                "AtlasAPIAccessNotConfigured"
            }
            OperatorError::AtlasApi(e) if e.is_unsupported_feature() => "AtlasUnsupportedFeature",
            OperatorError::AtlasApi(_) => "AtlasAPIError",
            OperatorError::DependencyNotReady(_) => "DependencyNotReady",
            OperatorError::DryRun { .. } => "DryRun",
            OperatorError::Internal(_) | OperatorError::SerializationError(_) => "InternalError",
            _ => "Error",
        }
    }
}

impl From<validator::ValidationErrors> for OperatorError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| match &e.message {
                    Some(msg) => format!("{}: {}", field, msg),
                    None => format!("{}: {}", field, e.code),
                })
            })
            .collect();
        messages.sort();
        OperatorError::Validation(messages.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_not_found_message() {
        let err = OperatorError::SecretNotFound {
            name: "local-secret".to_string(),
        };
        assert_eq!(err.to_string(), "Secret \"local-secret\" not found");
    }

    #[test]
    fn test_spec_version_messages() {
        let none = OperatorError::SpecVersion(SpecVersionError::None);
        assert!(none
            .to_string()
            .starts_with("no resource spec version specified"));
        assert_eq!(none.ready_reason(), "NoSpecVersion");

        let multiple = OperatorError::SpecVersion(SpecVersionError::Multiple);
        assert!(multiple
            .to_string()
            .starts_with("multiple resource spec versions specified"));
        assert_eq!(multiple.ready_reason(), "MultipleSpecVersions");
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            OperatorError::Validation("x".into()).class(),
            ErrorClass::Hold
        );
        assert_eq!(
            OperatorError::Timeout("x".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            OperatorError::Internal("x".into()).class(),
            ErrorClass::Propagate
        );

        let transient = OperatorError::AtlasApi(ApiError::new(503, None, "unavailable"));
        assert!(transient.is_retryable());

        let terminal = OperatorError::AtlasApi(ApiError::new(
            400,
            Some("FEATURE_UNSUPPORTED".into()),
            "not supported",
        ));
        assert!(!terminal.is_retryable());
        assert_eq!(terminal.ready_reason(), "AtlasUnsupportedFeature");
    }

    #[test]
    fn test_requeue_delay() {
        let hold = Duration::from_secs(60);
        let validation = OperatorError::Validation("bad".into());
        assert_eq!(validation.requeue_delay(hold), Some(hold));

        let timeout = OperatorError::Timeout("slow".into());
        assert!(timeout.requeue_delay(hold).is_none());
    }

    #[test]
    fn test_deletion_protection_message() {
        let err = OperatorError::DeletionProtection(ProtectedDomain::IpAccessList);
        assert_eq!(
            err.to_string(),
            "unable to reconcile IP Access List due to deletion protection being enabled. \
             see https://dochub.mongodb.org/core/ako-deletion-protection for further information"
        );
        assert_eq!(err.ready_reason(), "AtlasDeletionProtection");
    }
}
