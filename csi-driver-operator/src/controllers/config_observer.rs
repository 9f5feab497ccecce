use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use csi_driver_operator_apis::{ObservedConfig, OperatorSpec, TargetCsiConfig};
use kube::api::{DynamicObject, GroupVersionKind};

use super::ClusterAccess;
use crate::{
    controller_set::{Controller, ReconcileOutcome, SyncContext},
    errors::OperatorError,
    operator_state::OperatorStateAccessor,
    store::{ObjectKey, WatchKey},
};

/// Proxy status fields and the environment variables they map to.
const PROXY_VARIABLES: &[(&str, &str)] = &[
    ("httpProxy", "HTTP_PROXY"),
    ("httpsProxy", "HTTPS_PROXY"),
    ("noProxy", "NO_PROXY"),
];

/// Observes the cluster-wide proxy configuration into
/// `spec.observedConfig.targetcsiconfig.proxy`.
pub(crate) struct ConfigObserverController {
    name: String,
    cluster: ClusterAccess,
    state: Arc<OperatorStateAccessor>,
    proxy: ObjectKey,
}

impl ConfigObserverController {
    pub fn new(name: &str, cluster: ClusterAccess, state: Arc<OperatorStateAccessor>) -> Self {
        Self {
            name: name.to_string(),
            cluster,
            state,
            proxy: ObjectKey::new(proxy_gvk(), None, "cluster"),
        }
    }

    fn observed_spec(proxy: Option<&DynamicObject>) -> OperatorSpec {
        let status = proxy.and_then(|p| p.data.get("status"));
        let variables: BTreeMap<String, String> = PROXY_VARIABLES
            .iter()
            .filter_map(|(field, variable)| {
                status
                    .and_then(|s| s.get(*field))
                    .and_then(|v| v.as_str())
                    .filter(|v| !v.is_empty())
                    .map(|v| (variable.to_string(), v.to_string()))
            })
            .collect();
        OperatorSpec {
            observed_config: Some(ObservedConfig {
                targetcsiconfig: Some(TargetCsiConfig {
                    proxy: Some(variables),
                }),
            }),
            ..Default::default()
        }
    }

    async fn reconcile(&self, ctx: &SyncContext) -> Result<bool, OperatorError> {
        let proxy = self.cluster.live(&self.proxy).await?;
        let desired = Self::observed_spec(proxy.as_deref());
        let current = self
            .state
            .extract_spec(&ctx.instance, &self.name)?
            .unwrap_or_default();
        if current == desired {
            trace!("{}: observed config is up-to-date", self.name);
            return Ok(false);
        }
        self.state.apply_spec(&desired, &self.name).await?;
        info!("{}: observed proxy configuration changed", self.name);
        Ok(true)
    }
}

fn proxy_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("config.openshift.io", "v1", "Proxy")
}

/// The cluster-wide proxy configuration.
pub(crate) fn proxy_watch() -> WatchKey {
    WatchKey::new(proxy_gvk(), None)
}

#[async_trait]
impl Controller for ConfigObserverController {
    fn name(&self) -> &str {
        &self.name
    }

    fn watches(&self) -> Vec<WatchKey> {
        vec![proxy_watch()]
    }

    async fn sync(&self, ctx: &SyncContext) -> ReconcileOutcome {
        ReconcileOutcome::from_result(self.reconcile(ctx).await)
    }
}
