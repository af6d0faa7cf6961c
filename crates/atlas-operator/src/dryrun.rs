//! Dry-run recorder
//!
//! In dry-run mode every Atlas client is wrapped in a [`DryRunApi`]. Reads
//! pass through so handlers still see real state; writes are published as
//! Kubernetes events on the object being reconciled and never executed.
//! Each event note starts with `dry-run-instance=<uuid>` so a caller can wait
//! for the calls of one operator process.

use crate::atlas_client::{AtlasApi, ClientFactory};
use crate::connection::Credentials;
use crate::dispatch::ApiVersion;
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Event reason of every recorded write
pub const DRY_RUN_REASON: &str = "DryRun";

/// Destination of dry-run events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, regarding: &ObjectReference, action: &str, note: String) -> Result<()>;
}

/// [`EventSink`] writing Kubernetes events
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(client: Client, controller: &str, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, regarding: &ObjectReference, action: &str, note: String) -> Result<()> {
        self.recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: DRY_RUN_REASON.to_string(),
                    note: Some(note),
                    action: action.to_string(),
                    secondary: None,
                },
                regarding,
            )
            .await?;
        Ok(())
    }
}

/// Wraps a client so writes are recorded instead of executed
pub struct DryRunApi {
    inner: Arc<dyn AtlasApi>,
    sink: Arc<dyn EventSink>,
    regarding: ObjectReference,
    instance_id: Uuid,
}

impl DryRunApi {
    async fn record(&self, method: &str, path: &str) -> Result<Value> {
        let note = format!(
            "dry-run-instance={} would execute {} {}",
            self.instance_id, method, path
        );
        info!(
            method,
            path,
            object = self.regarding.name.as_deref().unwrap_or_default(),
            instance = %self.instance_id,
            "Dry run: recording write instead of executing it"
        );
        self.sink.publish(&self.regarding, method, note).await?;
        Err(OperatorError::DryRun {
            method: method.to_string(),
            path: path.to_string(),
        })
    }
}

#[async_trait]
impl AtlasApi for DryRunApi {
    fn version(&self) -> ApiVersion {
        self.inner.version()
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.inner.get(path).await
    }

    async fn post(&self, path: &str, _body: &Value) -> Result<Value> {
        self.record("POST", path).await
    }

    async fn patch(&self, path: &str, _body: &Value) -> Result<Value> {
        self.record("PATCH", path).await
    }

    async fn put(&self, path: &str, _body: &Value) -> Result<Value> {
        self.record("PUT", path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.record("DELETE", path).await.map(|_| ())
    }
}

/// [`ClientFactory`] wrapping every client it builds in a [`DryRunApi`]
pub struct DryRunClientFactory {
    inner: Arc<dyn ClientFactory>,
    sink: Arc<dyn EventSink>,
    instance_id: Uuid,
}

impl DryRunClientFactory {
    pub fn new(inner: Arc<dyn ClientFactory>, sink: Arc<dyn EventSink>) -> Self {
        let instance_id = Uuid::new_v4();
        info!(instance = %instance_id, "Dry-run mode enabled");
        Self {
            inner,
            sink,
            instance_id,
        }
    }

    /// Correlation id carried by every event of this process
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }
}

impl ClientFactory for DryRunClientFactory {
    fn client(
        &self,
        credentials: &Credentials,
        version: ApiVersion,
        regarding: &ObjectReference,
    ) -> Result<Arc<dyn AtlasApi>> {
        Ok(Arc::new(DryRunApi {
            inner: self.inner.client(credentials, version, regarding)?,
            sink: self.sink.clone(),
            regarding: regarding.clone(),
            instance_id: self.instance_id,
        }))
    }
}
