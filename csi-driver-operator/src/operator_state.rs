use std::{sync::Arc, time::Duration};

use csi_driver_operator_apis::{API_GROUP, API_VERSION, ClusterCSIDriver, KIND, OperatorSpec, OperatorStatus};
use kube::{ResourceExt, api::DynamicObject};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::{
    errors::OperatorError,
    managed_fields::{STATUS_SUBRESOURCE, owned_fields},
    store::{ObjectCache, ObjectKey, ObjectStore, WatchKey},
    utils::gvk_of,
};

/// Maximum number of attempts of [`OperatorStateAccessor::update_status_with_retry`].
const MAX_STATUS_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Shared access to the singleton `ClusterCSIDriver` instance.
///
/// Every controller reads the instance through the cache and writes only the
/// fields it owns as a field manager, so concurrent controllers merge their
/// updates instead of overwriting each other.
pub(crate) struct OperatorStateAccessor {
    store: Arc<dyn ObjectStore>,
    cache: Arc<dyn ObjectCache>,
    key: ObjectKey,
}

impl OperatorStateAccessor {
    pub fn new(store: Arc<dyn ObjectStore>, cache: Arc<dyn ObjectCache>, name: &str) -> Self {
        Self {
            store,
            cache,
            key: ObjectKey::new(gvk_of::<ClusterCSIDriver>(), None, name),
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    pub fn watch_key(&self) -> WatchKey {
        self.key.watch_key()
    }

    /// The instance as seen by the cache, falling back to the store.
    pub async fn get(&self) -> Result<Arc<DynamicObject>, OperatorError> {
        match self.cache.get(&self.key) {
            Some(obj) => Ok(obj),
            None => Ok(Arc::new(self.latest().await?)),
        }
    }

    /// The instance as currently stored.
    pub async fn latest(&self) -> Result<DynamicObject, OperatorError> {
        self.store
            .get(&self.key)
            .await?
            .ok_or_else(|| OperatorError::NotFound(format!("{} not found", self.key)))
    }

    pub fn convert(&self, obj: &DynamicObject) -> Result<ClusterCSIDriver, OperatorError> {
        let value = serde_json::to_value(obj).map_err(|e| {
            OperatorError::Conversion(format!("failed to serialize {}: {}", self.key, e))
        })?;
        serde_json::from_value(value).map_err(|e| {
            OperatorError::Conversion(format!(
                "failed to convert {} into {}: {}",
                self.key, KIND, e
            ))
        })
    }

    /// The part of the spec owned by `field_manager`.
    pub fn extract_spec(
        &self,
        obj: &DynamicObject,
        field_manager: &str,
    ) -> Result<Option<OperatorSpec>, OperatorError> {
        self.extract(obj, field_manager, None, "spec")
    }

    /// The part of the status owned by `field_manager`.
    pub fn extract_status(
        &self,
        obj: &DynamicObject,
        field_manager: &str,
    ) -> Result<Option<OperatorStatus>, OperatorError> {
        self.extract(obj, field_manager, Some(STATUS_SUBRESOURCE), "status")
    }

    fn extract<T: DeserializeOwned>(
        &self,
        obj: &DynamicObject,
        field_manager: &str,
        subresource: Option<&str>,
        field: &str,
    ) -> Result<Option<T>, OperatorError> {
        let typed = self.convert(obj)?;
        let owned = match owned_fields(obj, field_manager, subresource)? {
            Some(owned) => owned,
            None => return Ok(None),
        };
        let content = serde_json::to_value(&typed)?;
        let projected = match owned.project(&content)? {
            Some(Value::Object(mut map)) => map.remove(field),
            Some(other) => {
                return Err(OperatorError::Extraction(format!(
                    "fields owned by {} do not describe an object: {}",
                    field_manager, other
                )));
            }
            None => None,
        };
        match projected {
            Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
                OperatorError::Extraction(format!(
                    "{} owned by {} in {} is invalid: {}",
                    field, field_manager, self.key, e
                ))
            }),
            None => Ok(None),
        }
    }

    fn intent(&self, field: &str, content: Value) -> Result<DynamicObject, OperatorError> {
        let mut value = json!({
            "apiVersion": format!("{}/{}", API_GROUP, API_VERSION),
            "kind": KIND,
            "metadata": {"name": self.key.name},
        });
        value[field] = content;
        Ok(serde_json::from_value(value)?)
    }

    /// Merge the fields set in `patch` into the status owned by `field_manager`.
    ///
    /// Fails with [`OperatorError::Conflict`] if the owned status changed since
    /// `instance` was read. Returns whether the status was written.
    pub async fn update_status(
        &self,
        instance: &DynamicObject,
        patch: OperatorStatus,
        field_manager: &str,
    ) -> Result<bool, OperatorError> {
        let latest = self.latest().await?;
        let owned = self.extract_status(&latest, field_manager)?;
        if latest.resource_version() != instance.resource_version()
            && self.extract_status(instance, field_manager)? != owned
        {
            return Err(OperatorError::Conflict(format!(
                "status of {} owned by {} changed since resource version {}",
                self.key,
                field_manager,
                instance.resource_version().unwrap_or_default()
            )));
        }
        let current = owned.unwrap_or_default();
        let mut desired = current.clone();
        desired.merge(patch);
        if desired == current {
            trace!("status of {} owned by {} is up-to-date", self.key, field_manager);
            return Ok(false);
        }
        let intent = self.intent("status", serde_json::to_value(&desired)?)?;
        self.store.apply_status(intent, field_manager).await?;
        debug!("updated status of {} owned by {}", self.key, field_manager);
        Ok(true)
    }

    /// [`Self::update_status`], retrying conflicts with exponential backoff
    /// against the latest stored instance.
    pub async fn update_status_with_retry(
        &self,
        instance: &DynamicObject,
        patch: OperatorStatus,
        field_manager: &str,
    ) -> Result<bool, OperatorError> {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 1;
        let mut result = self.update_status(instance, patch.clone(), field_manager).await;
        while attempt < MAX_STATUS_ATTEMPTS && result.as_ref().is_err_and(|e| e.is_conflict()) {
            debug!(
                "status update of {} by {} conflicted, retrying in {:?}",
                self.key, field_manager, backoff
            );
            tokio::time::sleep(backoff).await;
            backoff *= 2;
            attempt += 1;
            let latest = self.latest().await?;
            result = self.update_status(&latest, patch.clone(), field_manager).await;
        }
        result
    }

    /// Apply `spec` as the complete spec owned by `field_manager`.
    pub async fn apply_spec(
        &self,
        spec: &OperatorSpec,
        field_manager: &str,
    ) -> Result<(), OperatorError> {
        let intent = self.intent("spec", serde_json::to_value(spec)?)?;
        self.store.apply(intent, field_manager).await?;
        debug!("applied spec of {} owned by {}", self.key, field_manager);
        Ok(())
    }
}
