//! DatabaseUser handler
//!
//! Users live inside an Atlas project. The project is named either directly
//! through `groupId` or through `groupRef`, in which case the Atlas id is read
//! from the referenced Group in the reflector cache and the user waits until
//! that Group has been created.

use crate::atlas_client::{is_not_found, AtlasApi};
use crate::connection::{secret_string, SecretSource};
use crate::crd::{AtlasResource, DatabaseUser, DatabaseUserObserved, DatabaseUserV20250312, Group};
use crate::dispatch::{ApiVersion, VersionRegistry};
use crate::error::{OperatorError, Result};
use crate::protection::keep_on_delete;
use crate::state::{LifecycleState, StateHandler, StateResult};
use crate::translate::{decode, encode, state_tracker, Translator};
use async_trait::async_trait;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Atlas project id of a user to adopt
pub const EXTERNAL_GROUP_ID_ANNOTATION: &str = "mongodb.com/external-group-id";

/// Username of a user to adopt
pub const EXTERNAL_USERNAME_ANNOTATION: &str = "mongodb.com/external-username";

/// Authentication database of a user to adopt, `admin` when absent
pub const EXTERNAL_DATABASE_NAME_ANNOTATION: &str = "mongodb.com/external-database-name";

/// Key of the password inside `passwordSecretRef`
pub const PASSWORD_KEY: &str = "password";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AtlasDatabaseUser {
    group_id: String,
    username: String,
    database_name: String,
}

/// Translator for the 2025-03-12 user schema
pub struct DatabaseUserTranslator;

impl DatabaseUserTranslator {
    fn spec(obj: &DatabaseUser) -> Result<&DatabaseUserV20250312> {
        obj.spec
            .v20250312
            .as_ref()
            .ok_or_else(|| OperatorError::Internal("database user has no v20250312 block".to_string()))
    }
}

impl Translator<DatabaseUser> for DatabaseUserTranslator {
    fn version(&self) -> ApiVersion {
        ApiVersion::V20250312
    }

    fn to_api(&self, obj: &DatabaseUser) -> Result<Value> {
        let spec = Self::spec(obj)?;
        let mut body = serde_json::json!({
            "username": spec.username,
            "databaseName": spec.database_name,
            "roles": spec.roles,
            "scopes": spec.scopes,
            "description": spec.description,
        });
        crate::translate::strip_nulls(&mut body);
        Ok(body)
    }

    fn from_api(&self, obj: &mut DatabaseUser, response: &Value) -> Result<()> {
        let user: AtlasDatabaseUser = decode(response, "database user")?;
        obj.status_mut().v20250312 = Some(DatabaseUserObserved {
            group_id: Some(user.group_id),
            username: Some(user.username),
            database_name: Some(user.database_name),
        });
        Ok(())
    }
}

/// Collaborators shared by every database user handler
#[derive(Clone)]
pub struct DatabaseUserHandlerDeps {
    pub secrets: Arc<dyn SecretSource>,
    /// Reflector cache of Groups, used to resolve `groupRef`
    pub groups: Store<Group>,
    pub object_deletion_protection: bool,
}

pub fn registry(deps: DatabaseUserHandlerDeps) -> VersionRegistry<DatabaseUser> {
    VersionRegistry::new().register(Arc::new(DatabaseUserTranslator), move |client, translator| {
        Arc::new(DatabaseUserHandler::new(client, translator, deps.clone()))
    })
}

fn user_path(group_id: &str, database_name: &str, username: &str) -> String {
    format!(
        "/groups/{}/databaseUsers/{}/{}",
        group_id,
        urlencoding::encode(database_name),
        urlencoding::encode(username)
    )
}

pub struct DatabaseUserHandler {
    client: Arc<dyn AtlasApi>,
    translator: Arc<dyn Translator<DatabaseUser>>,
    deps: DatabaseUserHandlerDeps,
}

impl DatabaseUserHandler {
    pub fn new(
        client: Arc<dyn AtlasApi>,
        translator: Arc<dyn Translator<DatabaseUser>>,
        deps: DatabaseUserHandlerDeps,
    ) -> Self {
        Self {
            client,
            translator,
            deps,
        }
    }

    /// Atlas id of the owning project
    fn group_id(&self, obj: &DatabaseUser) -> Result<String> {
        let spec = DatabaseUserTranslator::spec(obj)?;
        if let Some(id) = &spec.group_id {
            return Ok(id.clone());
        }
        let Some(group_ref) = &spec.group_ref else {
            return Err(OperatorError::Validation(
                "one of groupRef or groupId must be set".to_string(),
            ));
        };
        let namespace = obj.namespace().unwrap_or_default();
        let key = ObjectRef::<Group>::new(&group_ref.name).within(&namespace);
        self.deps
            .groups
            .get(&key)
            .and_then(|group| group.atlas_id().map(str::to_string))
            .ok_or_else(|| {
                OperatorError::DependencyNotReady(format!(
                    "Group {}/{} is not ready",
                    namespace, group_ref.name
                ))
            })
    }

    async fn password(&self, obj: &DatabaseUser) -> Result<Option<String>> {
        let spec = DatabaseUserTranslator::spec(obj)?;
        let Some(secret_ref) = &spec.password_secret_ref else {
            return Ok(None);
        };
        let secret = self
            .deps
            .secrets
            .get_secret(&obj.namespace().unwrap_or_default(), &secret_ref.name)
            .await?
            .ok_or_else(|| OperatorError::SecretNotFound {
                name: secret_ref.name.clone(),
            })?;
        secret_string(&secret, PASSWORD_KEY).map(Some)
    }

    /// Request body, tracker hash of the applied state
    async fn request(&self, obj: &DatabaseUser, group_id: &str) -> Result<(Value, String)> {
        let mut body = self.translator.to_api(obj)?;
        let password = self.password(obj).await?;

        let mut dependencies = vec![format!("groupId:{}", group_id)];
        if let Some(password) = &password {
            dependencies.push(hex::encode(Sha256::digest(password.as_bytes())));
        }
        let tracker = state_tracker(&encode(&obj.spec.v20250312)?, &dependencies);

        if let Value::Object(map) = &mut body {
            map.insert("groupId".to_string(), Value::String(group_id.to_string()));
            if let Some(password) = password {
                map.insert("password".to_string(), Value::String(password));
            }
        }
        Ok((body, tracker))
    }

    async fn create(&self, obj: &mut DatabaseUser) -> Result<StateResult> {
        let group_id = self.group_id(obj)?;
        let (body, tracker) = self.request(obj, &group_id).await?;
        let response = self
            .client
            .post(&format!("/groups/{}/databaseUsers", group_id), &body)
            .await?;
        self.translator.from_api(obj, &response)?;
        obj.status_mut().state_tracker = Some(tracker);
        info!(%group_id, "Created Atlas database user");
        Ok(StateResult::next(
            LifecycleState::Created,
            "Database user is created.",
        ))
    }

    async fn upsert(&self, obj: &mut DatabaseUser, settled: LifecycleState) -> Result<StateResult> {
        let Some(observed) = obj.status_ref().and_then(|s| s.v20250312.clone()) else {
            return self.create(obj).await;
        };
        let (Some(observed_group), Some(username), Some(database_name)) =
            (observed.group_id, observed.username, observed.database_name)
        else {
            return self.create(obj).await;
        };

        let group_id = self.group_id(obj)?;
        let spec = DatabaseUserTranslator::spec(obj)?;
        if group_id != observed_group
            || spec.username != username
            || spec.database_name != database_name
        {
            self.retire(obj, &observed_group, &database_name, &username)
                .await?;
            self.create(obj).await?;
            return Ok(StateResult::next(
                LifecycleState::Updated,
                "Database user is updated.",
            ));
        }

        let (body, tracker) = self.request(obj, &group_id).await?;
        if obj.status_ref().and_then(|s| s.state_tracker.as_deref()) == Some(tracker.as_str()) {
            return Ok(StateResult::unchanged(settled));
        }

        let response = self
            .client
            .patch(&user_path(&observed_group, &database_name, &username), &body)
            .await?;
        self.translator.from_api(obj, &response)?;
        obj.status_mut().state_tracker = Some(tracker);
        debug!(%username, "Updated Atlas database user");
        Ok(StateResult::next(
            LifecycleState::Updated,
            "Database user is updated.",
        ))
    }

    /// Drop the user under its previous identity before it is recreated
    async fn retire(
        &self,
        obj: &DatabaseUser,
        group_id: &str,
        database_name: &str,
        username: &str,
    ) -> Result<()> {
        if keep_on_delete(obj.annotations(), self.deps.object_deletion_protection) {
            info!(%group_id, %username, "Keeping Atlas database user under its previous identity");
            return Ok(());
        }
        match self
            .client
            .delete(&user_path(group_id, database_name, username))
            .await
        {
            Ok(()) => {
                info!(%group_id, %username, "Deleted Atlas database user of previous identity");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl StateHandler<DatabaseUser> for DatabaseUserHandler {
    fn version(&self) -> ApiVersion {
        self.translator.version()
    }

    #[instrument(skip_all, fields(user = %obj.name_any()))]
    async fn handle_initial(&self, obj: &mut DatabaseUser) -> Result<StateResult> {
        self.create(obj).await
    }

    #[instrument(skip_all, fields(user = %obj.name_any()))]
    async fn handle_import_requested(&self, obj: &mut DatabaseUser) -> Result<StateResult> {
        let annotations = obj.annotations();
        let required = |key: &str| {
            annotations.get(key).cloned().ok_or_else(|| {
                OperatorError::Validation(format!(
                    "import requested but annotation {} is missing",
                    key
                ))
            })
        };
        let group_id = required(EXTERNAL_GROUP_ID_ANNOTATION)?;
        let username = required(EXTERNAL_USERNAME_ANNOTATION)?;
        let database_name = annotations
            .get(EXTERNAL_DATABASE_NAME_ANNOTATION)
            .cloned()
            .unwrap_or_else(|| "admin".to_string());

        let response = self
            .client
            .get(&user_path(&group_id, &database_name, &username))
            .await?;
        self.translator.from_api(obj, &response)?;
        info!(%group_id, %username, "Imported Atlas database user");
        Ok(StateResult::next(
            LifecycleState::Imported,
            "Database user is imported.",
        ))
    }

    async fn handle_imported(&self, obj: &mut DatabaseUser) -> Result<StateResult> {
        self.upsert(obj, LifecycleState::Imported).await
    }

    async fn handle_creating(&self, obj: &mut DatabaseUser) -> Result<StateResult> {
        self.upsert(obj, LifecycleState::Created).await
    }

    async fn handle_created(&self, obj: &mut DatabaseUser) -> Result<StateResult> {
        self.upsert(obj, LifecycleState::Created).await
    }

    async fn handle_updating(&self, obj: &mut DatabaseUser) -> Result<StateResult> {
        self.upsert(obj, LifecycleState::Updated).await
    }

    async fn handle_updated(&self, obj: &mut DatabaseUser) -> Result<StateResult> {
        self.upsert(obj, LifecycleState::Updated).await
    }

    #[instrument(skip_all, fields(user = %obj.name_any()))]
    async fn handle_deletion_requested(&self, obj: &mut DatabaseUser) -> Result<StateResult> {
        if keep_on_delete(obj.annotations(), self.deps.object_deletion_protection) {
            info!("Keeping Atlas database user, releasing resource");
            return Ok(StateResult::next(LifecycleState::Deleted, "Deleted"));
        }

        let observed = obj.status_ref().and_then(|s| s.v20250312.clone());
        let Some(DatabaseUserObserved {
            group_id: Some(group_id),
            username: Some(username),
            database_name: Some(database_name),
        }) = observed
        else {
            return Ok(StateResult::next(LifecycleState::Deleted, "Deleted"));
        };

        match self
            .client
            .delete(&user_path(&group_id, &database_name, &username))
            .await
        {
            Ok(()) => {
                info!(%group_id, %username, "Deleted Atlas database user");
                Ok(StateResult::next(LifecycleState::Deleted, "Deleted"))
            }
            Err(e) if is_not_found(&e) => Ok(StateResult::next(LifecycleState::Deleted, "Deleted")),
            Err(e) => Err(e),
        }
    }

    async fn handle_deleting(&self, obj: &mut DatabaseUser) -> Result<StateResult> {
        self.handle_deletion_requested(obj).await
    }
}
