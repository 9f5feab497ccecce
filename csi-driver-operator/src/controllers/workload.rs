use std::sync::Arc;

use async_trait::async_trait;
use csi_driver_operator_apis::{OperatorCondition, OperatorSpec};

use super::ClusterAccess;
use crate::{
    assets::{AssetLoader, Substitutions, render},
    controller_set::{AS_EXPECTED, Controller, ReconcileOutcome, SyncContext},
    errors::OperatorError,
    hooks::{HookPipeline, Rollout, Workload},
    store::{ObjectKey, WatchKey},
    utils::{from_dynamic, to_dynamic},
};

const DEPLOYING: &'static str = "Deploying";

/// Renders a templated Deployment or DaemonSet through a hook pipeline and
/// keeps it applied.
pub(crate) struct WorkloadController<W: Workload> {
    name: String,
    cluster: ClusterAccess,
    assets: Arc<dyn AssetLoader>,
    asset: String,
    substitutions: Substitutions,
    hooks: HookPipeline<W>,
    watches: Vec<WatchKey>,
}

impl<W: Workload> WorkloadController<W> {
    pub fn new(
        name: &str,
        cluster: ClusterAccess,
        assets: Arc<dyn AssetLoader>,
        asset: &str,
        substitutions: Substitutions,
        hooks: HookPipeline<W>,
    ) -> Self {
        Self {
            name: name.to_string(),
            cluster,
            assets,
            asset: asset.to_string(),
            substitutions,
            hooks,
            watches: vec![],
        }
    }

    /// Cached objects the hooks read.
    pub fn with_watches(mut self, watches: Vec<WatchKey>) -> Self {
        self.watches = watches;
        self
    }

    /// The manifest as it should be applied for `spec`.
    pub fn render(&self, spec: &OperatorSpec) -> Result<W, OperatorError> {
        let substitutions = self
            .substitutions
            .clone()
            .with("LOG_LEVEL", spec.log_level().verbosity().to_string());
        let manifest = render(self.assets.as_ref(), &self.asset, &substitutions)?;
        self.hooks.run(spec, from_dynamic(&manifest)?)
    }

    fn conditions(&self, rollout: Rollout) -> [OperatorCondition; 2] {
        let kind = W::kind(&());
        let available = if rollout.available > 0 {
            OperatorCondition::new(
                &format!("{}Available", self.name),
                Some(true),
                AS_EXPECTED,
                String::new(),
            )
        } else {
            OperatorCondition::new(
                &format!("{}Available", self.name),
                Some(false),
                DEPLOYING,
                format!("Waiting for {} to deploy pods", kind),
            )
        };
        let progressing = if !rollout.observed
            || rollout.updated < rollout.desired
            || rollout.available < rollout.desired
        {
            OperatorCondition::new(
                &format!("{}Progressing", self.name),
                Some(true),
                DEPLOYING,
                format!(
                    "{} is progressing: {} of {} pods updated, {} available",
                    kind, rollout.updated, rollout.desired, rollout.available
                ),
            )
        } else {
            OperatorCondition::new(
                &format!("{}Progressing", self.name),
                Some(false),
                AS_EXPECTED,
                String::new(),
            )
        };
        [available, progressing]
    }

    async fn reconcile(&self, spec: &OperatorSpec) -> Result<ReconcileOutcome, OperatorError> {
        let manifest = to_dynamic(&self.render(spec)?)?;
        let key = ObjectKey::of(&manifest)?;
        let changed = self.cluster.apply_if_changed(manifest, &self.name).await?;
        let rollout = match self.cluster.live(&key).await? {
            Some(live) => from_dynamic::<W>(&live)?.rollout(),
            None => Rollout::default(),
        };
        let [available, progressing] = self.conditions(rollout);
        Ok(ReconcileOutcome {
            changed,
            ..Default::default()
        }
        .with_condition(available)
        .with_condition(progressing))
    }
}

#[async_trait]
impl<W: Workload> Controller for WorkloadController<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn watches(&self) -> Vec<WatchKey> {
        self.watches.clone()
    }

    async fn sync(&self, ctx: &SyncContext) -> ReconcileOutcome {
        match self.reconcile(ctx.spec()).await {
            Ok(outcome) => outcome,
            Err(e) => ReconcileOutcome::failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assets::{EmbeddedAssets, test_substitutions},
        controller_set::SyncResult,
        fake::{FakeCluster, dynamic},
        hooks::{observed_proxy_hook, replicas_hook, secret_hash_annotation, secret_hash_hook},
        operator_state::OperatorStateAccessor,
        utils::{gvk_of, secret_data_hash},
    };
    use k8s_openapi::{
        ByteString,
        api::apps::v1::{DaemonSet, Deployment},
    };
    use std::collections::BTreeMap;
    use serde_json::json;

    const NAME: &str = "vpc.block.csi.ibm.io";
    const NS: &str = "openshift-cluster-csi-drivers";

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

    fn deployment_controller(cluster: &Arc<FakeCluster>) -> WorkloadController<Deployment> {
        WorkloadController::new(
            "ControllerService",
            ClusterAccess::new(cluster.clone(), cluster.clone()),
            Arc::new(EmbeddedAssets),
            "controller.yaml",
            test_substitutions(),
            HookPipeline::default()
                .with("ObservedProxy", observed_proxy_hook())
                .with("SecretHash", secret_hash_hook(cluster.clone(), NS, "metrics-cert"))
                .with("Replicas", replicas_hook(cluster.clone())),
        )
    }

    fn put_secret(cluster: &FakeCluster, value: &str) {
        cluster.put(dynamic(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "metrics-cert", "namespace": NS},
            "data": {"tls.crt": value}
        })));
    }

    fn deployment_key() -> ObjectKey {
        ObjectKey::new(gvk_of::<Deployment>(), Some(NS), "ibm-vpc-block-csi-controller")
    }

    #[tokio::test]
    async fn deployment_is_applied_once_per_change() {
        let cluster = FakeCluster::new();
        put_secret(&cluster, "djE=");
        let controller = deployment_controller(&cluster);
        let ctx = context(&cluster, json!({"logLevel": "Debug"}));

        let outcome = controller.sync(&ctx).await;
        assert_eq!(SyncResult::Applied, outcome.result());
        assert_eq!(1, cluster.apply_count());
        assert_eq!(SyncResult::NoChangeNeeded, controller.sync(&ctx).await.result());
        assert_eq!(1, cluster.apply_count());

        let live: Deployment = from_dynamic(&cluster.object(&deployment_key()).unwrap()).unwrap();
        let args = live.spec.unwrap().template.spec.unwrap().containers[0]
            .args
            .clone()
            .unwrap();
        assert!(args.contains(&"--v=4".to_string()));

        // the secret changes: the pod template annotation changes
        put_secret(&cluster, "djI=");
        assert_eq!(SyncResult::Applied, controller.sync(&ctx).await.result());
        assert_eq!(2, cluster.apply_count());
        let live: Deployment = from_dynamic(&cluster.object(&deployment_key()).unwrap()).unwrap();
        let annotations = live.spec.unwrap().template.metadata.unwrap().annotations.unwrap();
        let v2 = BTreeMap::from([("tls.crt".to_string(), ByteString(b"v2".to_vec()))]);
        assert_eq!(
            Some(&secret_data_hash(Some(&v2))),
            annotations.get(&secret_hash_annotation(NS, "metrics-cert"))
        );

        // the log level changes
        let ctx = context(&cluster, json!({"logLevel": "TraceAll"}));
        assert_eq!(SyncResult::Applied, controller.sync(&ctx).await.result());
        assert_eq!(SyncResult::NoChangeNeeded, controller.sync(&ctx).await.result());
    }

    #[tokio::test]
    async fn removed_proxy_variables_are_pruned() {
        let cluster = FakeCluster::new();
        put_secret(&cluster, "djE=");
        let controller = deployment_controller(&cluster);
        let proxied = json!({"observedConfig": {"targetcsiconfig": {"proxy": {"HTTPS_PROXY": "http://proxy:3128"}}}});
        controller.sync(&context(&cluster, proxied)).await;
        controller.sync(&context(&cluster, json!({}))).await;
        let live: Deployment = from_dynamic(&cluster.object(&deployment_key()).unwrap()).unwrap();
        for container in live.spec.unwrap().template.spec.unwrap().containers {
            assert!(container
                .env
                .unwrap_or_default()
                .iter()
                .all(|e| e.name != "HTTPS_PROXY"));
        }
    }

    #[tokio::test]
    async fn missing_secret_fails_the_hook() {
        let cluster = FakeCluster::new();
        let controller = deployment_controller(&cluster);
        let outcome = controller.sync(&context(&cluster, json!({}))).await;
        assert_eq!("HookError", outcome.error.unwrap().reason());
        assert_eq!(0, cluster.apply_count());
    }

    #[tokio::test]
    async fn conditions_follow_rollout() {
        let cluster = FakeCluster::new();
        let controller: WorkloadController<DaemonSet> = WorkloadController::new(
            "NodeService",
            ClusterAccess::new(cluster.clone(), cluster.clone()),
            Arc::new(EmbeddedAssets),
            "node.yaml",
            test_substitutions(),
            HookPipeline::default().with("ObservedProxy", observed_proxy_hook()),
        );
        let ctx = context(&cluster, json!({}));
        let outcome = controller.sync(&ctx).await;
        assert!(!outcome.conditions[0].is_true());
        assert_eq!("NodeServiceAvailable", outcome.conditions[0].type_);
        assert!(outcome.conditions[1].is_true());

        let key = ObjectKey::new(gvk_of::<DaemonSet>(), Some(NS), "ibm-vpc-block-csi-node");
        let mut live = cluster.object(&key).unwrap();
        live.data["status"] = json!({
            "desiredNumberScheduled": 3,
            "currentNumberScheduled": 3,
            "numberMisscheduled": 0,
            "numberReady": 3,
            "numberAvailable": 3,
            "updatedNumberScheduled": 3
        });
        cluster.put(live);
        let outcome = controller.sync(&ctx).await;
        assert_eq!(SyncResult::NoChangeNeeded, outcome.result());
        assert!(outcome.conditions[0].is_true());
        assert!(!outcome.conditions[1].is_true());
    }
}
