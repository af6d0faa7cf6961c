//! # Atlas Kubernetes Operator
//!
//! Reconciliation engine for MongoDB Atlas resources declared as Kubernetes
//! custom resources. Each kind carries one block per Atlas Admin API version;
//! the engine picks the populated block, binds a handler for that version and
//! drives the object through a persisted lifecycle state machine.
//!
//! ## Features
//!
//! - **Lifecycle state machine**: `Initial`, `ImportRequested`, `Imported`,
//!   `Creating`, `Created`, `Updating`, `Updated`, `DeletionRequested`,
//!   `Deleting` and `Deleted`, persisted in the `State` condition
//! - **Version dispatch**: exactly one version block per object selects the
//!   translator and handler of that API version
//! - **Dependent watches**: a reference index maps Secrets and Groups back to
//!   the objects that reference them
//! - **Deletion protection**: writes that would discard Atlas state the spec
//!   does not declare are refused per domain
//! - **Dry run**: external writes are published as Kubernetes events instead
//!   of being executed
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use atlas_operator::prelude::*;
//! use kube::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     run(client, OperatorConfig::default()).await
//! }
//! ```
//!
//! ## Custom Resource Definitions
//!
//! ### Group
//!
//! ```yaml
//! apiVersion: atlas.generated.mongodb.com/v1
//! kind: Group
//! metadata:
//!   name: my-project
//! spec:
//!   connectionSecretRef:
//!     name: atlas-credentials
//!   v20250312:
//!     name: my-project
//!     orgId: 5f1b5c4e8f1b2c3d4e5f6a7b
//!     ipAccessList:
//!       - cidrBlock: 10.0.0.0/24
//!         comment: office
//! ```
//!
//! ### DatabaseUser
//!
//! ```yaml
//! apiVersion: atlas.generated.mongodb.com/v1
//! kind: DatabaseUser
//! metadata:
//!   name: orders-service
//! spec:
//!   v20250312:
//!     username: orders-service
//!     groupRef:
//!       name: my-project
//!     passwordSecretRef:
//!       name: orders-service-password
//!     roles:
//!       - roleName: readWrite
//!         databaseName: orders
//! ```
//!
//! ## Modules
//!
//! - [`reconciler`] - lifecycle pass, finalizer and status persistence
//! - [`state`] - lifecycle states and the per-state handler contract
//! - [`dispatch`] - version selection and handler binding
//! - [`indexer`] / [`watch`] - reference index and dependent-watch routing
//! - [`protection`] - deletion-protection guard and drift detection
//! - [`connection`] - credential resolution
//! - [`atlas_client`] / [`dryrun`] - Admin API client and dry-run recorder
//! - [`group_controller`] / [`database_user_controller`] - kind handlers
//! - [`controller`] - controller wiring
//!
//! ## Metrics
//!
//! - `atlas_operator_reconciliations_total`
//! - `atlas_operator_reconciliation_errors_total`
//! - `atlas_operator_reconciliation_duration_seconds`
//! - `atlas_operator_state_transitions_total`
//! - `atlas_operator_deletion_protection_blocks_total`

pub mod atlas_client;
pub mod conditions;
pub mod config;
pub mod connection;
pub mod controller;
pub mod crd;
pub mod database_user_controller;
pub mod dispatch;
pub mod dryrun;
pub mod error;
pub mod group_controller;
pub mod indexer;
pub mod protection;
pub mod reconciler;
pub mod state;
pub mod translate;
pub mod watch;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::atlas_client::{AtlasApi, AtlasClientConfig, ClientFactory, HttpClientFactory};
    pub use crate::config::OperatorConfig;
    pub use crate::connection::{ConnectionResolver, Credentials, GlobalSecretRef};
    pub use crate::controller::{run, ControllerMetrics, OperatorContext};
    pub use crate::crd::{
        AtlasResource, Condition, ConditionStatus, DatabaseUser, DatabaseUserSpec,
        DatabaseUserStatus, Group, GroupSpec, GroupStatus,
    };
    pub use crate::dispatch::{ApiVersion, Dispatcher, HandlerResolver, VersionRegistry};
    pub use crate::error::{OperatorError, Result};
    pub use crate::protection::{DeletionProtectionGuard, ProtectedDomain};
    pub use crate::reconciler::{PassSettings, StateReconciler};
    pub use crate::state::{LifecycleState, StateHandler, StateResult};
    pub use crate::translate::Translator;
}
