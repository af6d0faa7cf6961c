//! Operator configuration
//!
//! The binary parses flags and environment variables; the library only sees
//! this validated struct.

use crate::atlas_client::AtlasClientConfig;
use crate::connection::GlobalSecretRef;
use crate::error::{OperatorError, Result};
use crate::reconciler::PassSettings;
use std::time::Duration;
use validator::{Validate, ValidationError};

fn validate_domain(domain: &str) -> std::result::Result<(), ValidationError> {
    if domain.starts_with("https://") || domain.starts_with("http://") {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_domain")
            .with_message(format!("'{}' must be an http(s) URL", domain).into()))
    }
}

/// Runtime settings shared by all controllers
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct OperatorConfig {
    /// Watched namespace, all namespaces when `None`
    pub namespace: Option<String>,

    #[validate(length(min = 1, max = 253, message = "global secret name must be 1-253 characters"))]
    pub global_secret_name: String,

    #[validate(length(min = 1, max = 63, message = "operator namespace must be 1-63 characters"))]
    pub operator_namespace: String,

    #[validate(custom(function = "validate_domain"))]
    pub atlas_domain: String,

    /// Keep Atlas objects when their custom resource is deleted
    pub object_deletion_protection: bool,

    /// Refuse writes that discard unmanaged sub-resources
    pub subobject_deletion_protection: bool,

    pub dry_run: bool,

    /// Concurrent reconciles per kind
    #[validate(range(min = 1, max = 64, message = "concurrency must be between 1 and 64"))]
    pub concurrency: u16,

    #[validate(range(min = 1, max = 600, message = "request timeout must be between 1 and 600 seconds"))]
    pub request_timeout_secs: u64,

    #[validate(range(min = 1, message = "reapply period must be at least one second"))]
    pub reapply_period_secs: u64,

    /// Requeue delay of passes waiting on the user
    #[validate(range(min = 1, message = "hold interval must be at least one second"))]
    pub hold_interval_secs: u64,

    /// Retries of transient Atlas failures inside one call
    #[validate(range(max = 10, message = "at most 10 retries are allowed"))]
    pub max_retries: u32,

    /// Reporter instance of published events, usually the pod name
    pub instance: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            global_secret_name: "mongodb-atlas-operator-api-key".to_string(),
            operator_namespace: "mongodb-atlas-system".to_string(),
            atlas_domain: "https://cloud.mongodb.com/".to_string(),
            object_deletion_protection: true,
            subobject_deletion_protection: true,
            dry_run: false,
            concurrency: 4,
            request_timeout_secs: 30,
            reapply_period_secs: 3600,
            hold_interval_secs: 60,
            max_retries: 3,
            instance: None,
        }
    }
}

impl OperatorConfig {
    /// Validate, reporting every violated constraint at once
    pub fn validated(self) -> Result<Self> {
        self.validate()
            .map_err(|e| OperatorError::InvalidConfig(e.to_string()))?;
        Ok(self)
    }

    pub fn pass_settings(&self) -> PassSettings {
        PassSettings {
            hold_interval: Duration::from_secs(self.hold_interval_secs),
            reapply_period: Duration::from_secs(self.reapply_period_secs),
        }
    }

    pub fn client_config(&self) -> AtlasClientConfig {
        AtlasClientConfig {
            domain: self.atlas_domain.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_retries: self.max_retries,
            ..Default::default()
        }
    }

    pub fn global_secret(&self) -> GlobalSecretRef {
        GlobalSecretRef {
            namespace: self.operator_namespace.clone(),
            name: self.global_secret_name.clone(),
        }
    }
}
