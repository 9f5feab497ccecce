use std::sync::Arc;

use kube::api::DynamicObject;
use serde_json::json;

use crate::{
    errors::OperatorError,
    managed_fields::{apply_content, last_applied},
    store::{ObjectCache, ObjectKey, ObjectStore},
};

pub(crate) mod config_observer;
pub(crate) mod log_level;
pub(crate) mod management_state;
pub(crate) mod secret_sync;
pub(crate) mod static_resources;
pub(crate) mod storage_class;
pub(crate) mod workload;

/// Store and cache handles shared by all controllers.
#[derive(Clone)]
pub(crate) struct ClusterAccess {
    pub store: Arc<dyn ObjectStore>,
    pub cache: Arc<dyn ObjectCache>,
}

impl ClusterAccess {
    pub fn new(store: Arc<dyn ObjectStore>, cache: Arc<dyn ObjectCache>) -> Self {
        Self { store, cache }
    }

    /// The live object, from the cache if it maintains it.
    pub async fn live(&self, key: &ObjectKey) -> Result<Option<Arc<DynamicObject>>, OperatorError> {
        match self.cache.get(key) {
            Some(obj) => Ok(Some(obj)),
            None => Ok(self.store.get(key).await?.map(Arc::new)),
        }
    }

    /// Apply `manifest` as `manager`, unless the live object already carries
    /// exactly what `manager` would apply. Returns whether it applied.
    pub async fn apply_if_changed(
        &self,
        manifest: DynamicObject,
        manager: &str,
    ) -> Result<bool, OperatorError> {
        let key = ObjectKey::of(&manifest)?;
        if let Some(live) = self.live(&key).await? {
            let current = last_applied(&live, manager)?.unwrap_or_else(|| json!({}));
            let patch = json_patch::diff(&current, &apply_content(&manifest)?);
            if patch.0.is_empty() {
                trace!("{} is up-to-date", key);
                return Ok(false);
            }
            debug!("{} differs from manifest: {}", key, serde_json::to_string(&patch)?);
        }
        self.store.apply(manifest, manager).await?;
        info!("applied {}", key);
        Ok(true)
    }
}
