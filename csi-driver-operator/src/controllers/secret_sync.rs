use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;

use super::ClusterAccess;
use crate::{
    controller_set::{Controller, ReconcileOutcome, SyncContext},
    errors::OperatorError,
    store::{ObjectKey, WatchKey},
    utils::{from_dynamic, gvk_of, secret_data_hash, to_dynamic},
};

const MANAGED_BY_LABEL: &'static str = "app.kubernetes.io/managed-by";
const SOURCE_ANNOTATION: &'static str = "operator.openshift.io/source-secret";
const HASH_ANNOTATION: &'static str = "operator.openshift.io/source-secret-hash";

/// Mirrors the content of a secret into another namespace.
pub(crate) struct SecretSyncController {
    name: String,
    cluster: ClusterAccess,
    source: ObjectKey,
    destination: ObjectKey,
}

impl SecretSyncController {
    pub fn new(
        name: &str,
        cluster: ClusterAccess,
        (source_namespace, source_name): (&str, &str),
        (destination_namespace, destination_name): (&str, &str),
    ) -> Self {
        Self {
            name: name.to_string(),
            cluster,
            source: ObjectKey::new(gvk_of::<Secret>(), Some(source_namespace), source_name),
            destination: ObjectKey::new(
                gvk_of::<Secret>(),
                Some(destination_namespace),
                destination_name,
            ),
        }
    }

    fn destination(&self, source: Secret) -> Secret {
        let hash = secret_data_hash(source.data.as_ref());
        Secret {
            metadata: ObjectMeta {
                name: Some(self.destination.name.clone()),
                namespace: self.destination.namespace.clone(),
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    self.name.clone(),
                )])),
                annotations: Some(BTreeMap::from([
                    (
                        SOURCE_ANNOTATION.to_string(),
                        format!(
                            "{}/{}",
                            self.source.namespace.clone().unwrap_or_default(),
                            self.source.name
                        ),
                    ),
                    (HASH_ANNOTATION.to_string(), hash),
                ])),
                ..Default::default()
            },
            data: source.data,
            type_: source.type_,
            ..Default::default()
        }
    }

    async fn reconcile(&self) -> Result<bool, OperatorError> {
        let source: Secret = match self.cluster.live(&self.source).await? {
            Some(source) => from_dynamic(&source)?,
            None => {
                return Err(OperatorError::SourceNotFound(format!(
                    "source secret {} does not exist",
                    self.source
                )));
            }
        };
        let destination = to_dynamic(&self.destination(source))?;
        self.cluster.apply_if_changed(destination, &self.name).await
    }
}

#[async_trait]
impl Controller for SecretSyncController {
    fn name(&self) -> &str {
        &self.name
    }

    fn watches(&self) -> Vec<WatchKey> {
        vec![self.source.watch_key(), self.destination.watch_key()]
    }

    async fn sync(&self, _: &SyncContext) -> ReconcileOutcome {
        ReconcileOutcome::from_result(self.reconcile().await)
    }
}
