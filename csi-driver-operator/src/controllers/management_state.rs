use async_trait::async_trait;
use csi_driver_operator_apis::ManagementState;

use crate::{
    controller_set::{Controller, ReconcileOutcome, SyncContext},
    errors::OperatorError,
};

/// Reports management states the operator cannot act on.
pub(crate) struct ManagementStateController {
    name: String,
    removal_supported: bool,
}

impl ManagementStateController {
    pub fn new(name: &str, removal_supported: bool) -> Self {
        Self {
            name: name.to_string(),
            removal_supported,
        }
    }
}

#[async_trait]
impl Controller for ManagementStateController {
    fn name(&self) -> &str {
        &self.name
    }

    fn honors_management_state(&self) -> bool {
        false
    }

    async fn sync(&self, ctx: &SyncContext) -> ReconcileOutcome {
        match ctx.spec().management_state() {
            ManagementState::Removed if !self.removal_supported => {
                ReconcileOutcome::failed(OperatorError::UnsupportedManagementState(
                    "removal of the CSI driver is not supported".to_string(),
                ))
            }
            _ => ReconcileOutcome::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        controller_set::SyncResult,
        fake::{FakeCluster, dynamic},
        operator_state::OperatorStateAccessor,
    };
    use serde_json::json;

    fn context(management_state: &str) -> SyncContext {
        let cluster = FakeCluster::new();
        let instance = cluster.put(dynamic(json!({
            "apiVersion": "operator.openshift.io/v1",
            "kind": "ClusterCSIDriver",
            "metadata": {"name": "vpc.block.csi.ibm.io"},
            "spec": {"managementState": management_state}
        })));
        let state = OperatorStateAccessor::new(cluster.clone(), cluster, "vpc.block.csi.ibm.io");
        SyncContext {
            driver: state.convert(&instance).unwrap(),
            instance: Arc::new(instance),
        }
    }

    #[tokio::test]
    async fn removal_is_unsupported() {
        let controller = ManagementStateController::new("ManagementState", false);
        let outcome = controller.sync(&context("Removed")).await;
        assert_eq!(SyncResult::Failed, outcome.result());
        assert_eq!("UnsupportedManagementState", outcome.error.unwrap().reason());
        for state in ["Managed", "Unmanaged", "Force"] {
            assert_eq!(
                SyncResult::NoChangeNeeded,
                controller.sync(&context(state)).await.result()
            );
        }
    }
}
