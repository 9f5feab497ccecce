use std::sync::Arc;

use async_trait::async_trait;
use csi_driver_operator_apis::{OperatorSpec, StorageClassState};
use k8s_openapi::api::storage::v1::StorageClass;

use super::ClusterAccess;
use crate::{
    assets::{AssetLoader, Substitutions, render},
    controller_set::{Controller, ReconcileOutcome, SyncContext},
    errors::OperatorError,
    hooks::HookPipeline,
    store::{ObjectKey, WatchKey},
    utils::{from_dynamic, gvk_of, to_dynamic},
};

/// Manages the default storage classes of the driver.
pub(crate) struct StorageClassController {
    name: String,
    cluster: ClusterAccess,
    assets: Arc<dyn AssetLoader>,
    storage_classes: Vec<String>,
    substitutions: Substitutions,
    hooks: HookPipeline<StorageClass>,
}

impl StorageClassController {
    pub fn new(
        name: &str,
        cluster: ClusterAccess,
        assets: Arc<dyn AssetLoader>,
        storage_classes: &[&str],
        substitutions: Substitutions,
        hooks: HookPipeline<StorageClass>,
    ) -> Self {
        Self {
            name: name.to_string(),
            cluster,
            assets,
            storage_classes: storage_classes.iter().map(|s| s.to_string()).collect(),
            substitutions,
            hooks,
        }
    }

    fn render(&self, asset: &str, spec: &OperatorSpec) -> Result<StorageClass, OperatorError> {
        let manifest = render(self.assets.as_ref(), asset, &self.substitutions)?;
        self.hooks.run(spec, from_dynamic(&manifest)?)
    }

    /// Parameters, provisioner and reclaim policy of a storage class cannot be
    /// updated in place.
    fn needs_recreate(live: &StorageClass, desired: &StorageClass) -> bool {
        live.parameters.clone().unwrap_or_default() != desired.parameters.clone().unwrap_or_default()
            || live.provisioner != desired.provisioner
            || (desired.reclaim_policy.is_some() && live.reclaim_policy != desired.reclaim_policy)
            || (desired.volume_binding_mode.is_some()
                && live.volume_binding_mode != desired.volume_binding_mode)
    }

    async fn ensure(&self, asset: &str, spec: &OperatorSpec) -> Result<bool, OperatorError> {
        let desired = self.render(asset, spec)?;
        let manifest = to_dynamic(&desired)?;
        let key = ObjectKey::of(&manifest)?;
        if let Some(live) = self.cluster.live(&key).await? {
            let live: StorageClass = from_dynamic(&live)?;
            if Self::needs_recreate(&live, &desired) {
                info!("{}: recreating {} with changed parameters", self.name, key);
                self.cluster.store.delete(&key).await?;
                self.cluster.store.apply(manifest, &self.name).await?;
                return Ok(true);
            }
        }
        self.cluster.apply_if_changed(manifest, &self.name).await
    }

    async fn remove(&self, asset: &str) -> Result<bool, OperatorError> {
        let manifest = render(self.assets.as_ref(), asset, &self.substitutions)?;
        let key = ObjectKey::of(&manifest)?;
        let deleted = self.cluster.store.delete(&key).await?;
        if deleted {
            info!("{}: deleted {}", self.name, key);
        }
        Ok(deleted)
    }

    async fn reconcile(&self, spec: &OperatorSpec) -> Result<bool, OperatorError> {
        let state = spec.storage_class_state();
        if state == StorageClassState::Unmanaged {
            trace!("{}: storage classes are unmanaged", self.name);
            return Ok(false);
        }
        let mut changed = false;
        let mut errors = vec![];
        for asset in &self.storage_classes {
            let result = match state {
                StorageClassState::Removed => self.remove(asset).await,
                _ => self.ensure(asset, spec).await,
            };
            match result {
                Ok(c) => changed |= c,
                Err(e) => {
                    warn!("{}: {}: {}", self.name, asset, e);
                    errors.push(e);
                }
            }
        }
        match OperatorError::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(changed),
        }
    }
}

#[async_trait]
impl Controller for StorageClassController {
    fn name(&self) -> &str {
        &self.name
    }

    fn watches(&self) -> Vec<WatchKey> {
        vec![WatchKey::new(gvk_of::<StorageClass>(), None)]
    }

    async fn sync(&self, ctx: &SyncContext) -> ReconcileOutcome {
        ReconcileOutcome::from_result(self.reconcile(ctx.spec()).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assets::{EmbeddedAssets, test_substitutions},
        controller_set::SyncResult,
        fake::{FakeCluster, Op, dynamic},
        hooks::encryption_key_hook,
        operator_state::OperatorStateAccessor,
    };
    use serde_json::json;

    const NAME: &str = "vpc.block.csi.ibm.io";
    const CLASSES: &[&str] = &[
        "storageclass/vpc-block-5iopsTier-StorageClass.yaml",
        "storageclass/vpc-block-custom-StorageClass.yaml",
    ];

    fn context(cluster: &Arc<FakeCluster>, spec: serde_json::Value) -> SyncContext {
        let instance = cluster.put(dynamic(json!({
            "apiVersion": "operator.openshift.io/v1",
            "kind": "ClusterCSIDriver",
            "metadata": {"name": NAME},
            "spec": spec
        })));
        let state = OperatorStateAccessor::new(cluster.clone(), cluster.clone(), NAME);
        SyncContext {
            driver: state.convert(&instance).unwrap(),
            instance: Arc::new(instance),
        }
    }

    fn controller(cluster: &Arc<FakeCluster>) -> StorageClassController {
        StorageClassController::new(
            "StorageClass",
            ClusterAccess::new(cluster.clone(), cluster.clone()),
            Arc::new(EmbeddedAssets),
            CLASSES,
            test_substitutions(),
            HookPipeline::default().with("EncryptionKey", encryption_key_hook()),
        )
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new(gvk_of::<StorageClass>(), None, name)
    }

    #[tokio::test]
    async fn storage_classes_are_applied_once() {
        let cluster = FakeCluster::new();
        let controller = controller(&cluster);
        let ctx = context(&cluster, json!({}));
        assert_eq!(SyncResult::Applied, controller.sync(&ctx).await.result());
        assert_eq!(2, cluster.apply_count());
        assert_eq!(SyncResult::NoChangeNeeded, controller.sync(&ctx).await.result());
        assert_eq!(2, cluster.apply_count());
    }

    #[tokio::test]
    async fn changed_parameters_recreate_the_class() {
        let cluster = FakeCluster::new();
        let controller = controller(&cluster);
        controller.sync(&context(&cluster, json!({}))).await;
        cluster.clear_ops();

        let crn = "crn:v1:bluemix:public:kms:us-south:a/1234:key:abcd";
        let ctx = context(
            &cluster,
            json!({"driverConfig": {"driverType": "IBMCloud", "ibmcloud": {"encryptionKeyCRN": crn}}}),
        );
        assert_eq!(SyncResult::Applied, controller.sync(&ctx).await.result());
        let custom = key("ibmc-vpc-block-custom");
        assert!(cluster.ops().contains(&Op::Delete(custom.clone())));
        assert!(cluster
            .ops()
            .contains(&Op::Apply(custom.clone(), "StorageClass".to_string())));
        let live: StorageClass = from_dynamic(&cluster.object(&custom).unwrap()).unwrap();
        let parameters = live.parameters.unwrap();
        assert_eq!("true", parameters["encrypted"]);
        assert_eq!(crn, parameters["encryptionKey"]);

        cluster.clear_ops();
        assert_eq!(SyncResult::NoChangeNeeded, controller.sync(&ctx).await.result());
        assert!(cluster.ops().is_empty());
    }

    #[tokio::test]
    async fn storage_class_state_is_honored() {
        let cluster = FakeCluster::new();
        let controller = controller(&cluster);
        controller.sync(&context(&cluster, json!({}))).await;
        cluster.clear_ops();

        let unmanaged = context(&cluster, json!({"storageClassState": "Unmanaged"}));
        assert_eq!(SyncResult::NoChangeNeeded, controller.sync(&unmanaged).await.result());
        assert!(cluster.ops().is_empty());

        let removed = context(&cluster, json!({"storageClassState": "Removed"}));
        assert_eq!(SyncResult::Applied, controller.sync(&removed).await.result());
        assert_eq!(2, cluster.delete_count());
        assert!(cluster.object(&key("ibmc-vpc-block-5iops-tier")).is_none());
        assert_eq!(SyncResult::NoChangeNeeded, controller.sync(&removed).await.result());
    }
}
