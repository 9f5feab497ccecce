use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

use crate::{
    store::{ObjectKey, ObjectStore},
    utils::gvk_of,
};

/// A condition evaluated anew on every reconciliation.
#[async_trait]
pub(crate) trait Predicate: Send + Sync {
    async fn evaluate(&self) -> bool;
}

pub(crate) struct Constant(pub bool);

#[async_trait]
impl Predicate for Constant {
    async fn evaluate(&self) -> bool {
        self.0
    }
}

/// Holds while the named `CustomResourceDefinition` exists.
pub(crate) struct CrdExists {
    store: Arc<dyn ObjectStore>,
    key: ObjectKey,
}

impl CrdExists {
    pub fn new(store: Arc<dyn ObjectStore>, name: &str) -> Self {
        Self {
            store,
            key: ObjectKey::new(gvk_of::<CustomResourceDefinition>(), None, name),
        }
    }
}

#[async_trait]
impl Predicate for CrdExists {
    async fn evaluate(&self) -> bool {
        match self.store.get(&self.key).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!("failed to look up {}: {}", self.key, e);
                false
            }
        }
    }
}
