use std::sync::Arc;

use csi_driver_operator_apis::ClusterCSIDriver;
use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment},
    core::v1::{ConfigMap, Node, Secret},
    storage::v1::StorageClass,
};

use crate::{
    assets::AssetLoader,
    configuration::Configuration,
    controller_set::{Controller, ControllerSet},
    controllers::{
        ClusterAccess,
        config_observer::{ConfigObserverController, proxy_watch},
        log_level::LogLevelController,
        management_state::ManagementStateController,
        secret_sync::SecretSyncController,
        static_resources::StaticResourceController,
        storage_class::StorageClassController,
        workload::WorkloadController,
    },
    errors::OperatorError,
    hooks::{
        HookPipeline, ca_bundle_hook, encryption_key_hook, observed_proxy_hook, replicas_hook,
        secret_hash_hook,
    },
    operator_state::OperatorStateAccessor,
    predicates::{Constant, CrdExists},
    store::WatchKey,
    utils::gvk_of,
};

const STATIC_RESOURCES: &[&str] = &[
    "rbac/privileged_role.yaml",
    "rbac/node_privileged_binding.yaml",
    "rbac/prometheus_role.yaml",
    "rbac/prometheus_rolebinding.yaml",
    "rbac/kube_rbac_proxy_role.yaml",
    "rbac/kube_rbac_proxy_binding.yaml",
    "rbac/initcontainer_role.yaml",
    "rbac/initcontainer_rolebinding.yaml",
    "rbac/lease_leader_election_role.yaml",
    "rbac/lease_leader_election_rolebinding.yaml",
    "rbac/main_attacher_binding.yaml",
    "rbac/main_provisioner_binding.yaml",
    "rbac/volumesnapshot_reader_provisioner_binding.yaml",
    "rbac/configmap_and_secret_reader_provisioner_binding.yaml",
    "rbac/main_resizer_binding.yaml",
    "rbac/main_snapshotter_binding.yaml",
    "configmap.yaml",
    "csidriver.yaml",
    "service.yaml",
    "cabundle_cm.yaml",
    "controller_sa.yaml",
    "node_sa.yaml",
    "network-policy-allow-ingress-to-csi-driver-metrics.yaml",
];

const STORAGE_CLASSES: &[&str] = &[
    "storageclass/vpc-block-10iopsTier-StorageClass.yaml",
    "storageclass/vpc-block-5iopsTier-StorageClass.yaml",
    "storageclass/vpc-block-custom-StorageClass.yaml",
];

const VOLUME_SNAPSHOT_CLASS_CRD: &'static str = "volumesnapshotclasses.snapshot.storage.k8s.io";

/// Everything the controllers read from the cache.
pub(crate) fn watches(config: &Configuration) -> Vec<WatchKey> {
    let ns = Some(config.operator_namespace.as_str());
    let mut watches = vec![
        WatchKey::new(gvk_of::<ClusterCSIDriver>(), None),
        WatchKey::new(gvk_of::<Secret>(), ns),
        WatchKey::new(gvk_of::<ConfigMap>(), ns),
        WatchKey::new(gvk_of::<Deployment>(), ns),
        WatchKey::new(gvk_of::<DaemonSet>(), ns),
        WatchKey::new(gvk_of::<Node>(), None),
        WatchKey::new(gvk_of::<StorageClass>(), None),
        proxy_watch(),
    ];
    for namespace in [&config.secret_sync_source.0, &config.secret_sync_destination.0] {
        let watch = WatchKey::new(gvk_of::<Secret>(), Some(namespace.as_str()));
        if !watches.contains(&watch) {
            watches.push(watch);
        }
    }
    watches
}

/// The controllers of the operator, in registration order.
pub(crate) fn controllers(
    config: &Configuration,
    cluster: ClusterAccess,
    state: Arc<OperatorStateAccessor>,
    assets: Arc<dyn AssetLoader>,
) -> Vec<Arc<dyn Controller>> {
    let ns = config.operator_namespace.as_str();
    let substitutions = config.substitutions();
    let secrets = WatchKey::new(gvk_of::<Secret>(), Some(ns));
    let config_maps = WatchKey::new(gvk_of::<ConfigMap>(), Some(ns));
    let nodes = WatchKey::new(gvk_of::<Node>(), None);
    vec![
        Arc::new(LogLevelController::new("LogLevelController")) as Arc<dyn Controller>,
        Arc::new(ManagementStateController::new("ManagementStateController", false)),
        Arc::new(
            StaticResourceController::new(
                "IBMBlockDriverStaticResourcesController",
                cluster.clone(),
                assets.clone(),
                substitutions.clone(),
            )
            .with_resources(STATIC_RESOURCES),
        ),
        Arc::new(
            StaticResourceController::new(
                "IBMBlockDriverConditionalStaticResourcesController",
                cluster.clone(),
                assets.clone(),
                substitutions.clone(),
            )
            .with_conditional_resources(
                &["volumesnapshotclass.yaml"],
                Arc::new(CrdExists::new(cluster.store.clone(), VOLUME_SNAPSHOT_CLASS_CRD)),
                Arc::new(Constant(false)),
            ),
        ),
        Arc::new(ConfigObserverController::new(
            "IBMBlockDriverCSIConfigObserverController",
            cluster.clone(),
            state,
        )),
        Arc::new(
            WorkloadController::<Deployment>::new(
                "IBMBlockDriverControllerServiceController",
                cluster.clone(),
                assets.clone(),
                "controller.yaml",
                substitutions.clone(),
                HookPipeline::default()
                    .with("ObservedProxy", observed_proxy_hook())
                    .with(
                        "SecretHashAnnotation",
                        secret_hash_hook(cluster.cache.clone(), ns, &config.metrics_cert_secret),
                    )
                    .with(
                        "CABundle",
                        ca_bundle_hook(cluster.cache.clone(), ns, &config.trusted_ca_config_map),
                    )
                    .with("Replicas", replicas_hook(cluster.cache.clone())),
            )
            .with_watches(vec![
                nodes,
                secrets,
                config_maps.clone(),
                WatchKey::new(gvk_of::<Deployment>(), Some(ns)),
            ]),
        ),
        Arc::new(
            WorkloadController::<DaemonSet>::new(
                "IBMBlockDriverNodeServiceController",
                cluster.clone(),
                assets.clone(),
                "node.yaml",
                substitutions.clone(),
                HookPipeline::default()
                    .with("ObservedProxy", observed_proxy_hook())
                    .with(
                        "CABundle",
                        ca_bundle_hook(cluster.cache.clone(), ns, &config.trusted_ca_config_map),
                    ),
            )
            .with_watches(vec![
                config_maps,
                WatchKey::new(gvk_of::<DaemonSet>(), Some(ns)),
            ]),
        ),
        Arc::new(StorageClassController::new(
            "IBMBlockStorageClassController",
            cluster.clone(),
            assets.clone(),
            STORAGE_CLASSES,
            substitutions.clone(),
            HookPipeline::default().with("EncryptionKey", encryption_key_hook()),
        )),
        Arc::new(SecretSyncController::new(
            "SecretSyncController",
            cluster.clone(),
            (
                config.secret_sync_source.0.as_str(),
                config.secret_sync_source.1.as_str(),
            ),
            (
                config.secret_sync_destination.0.as_str(),
                config.secret_sync_destination.1.as_str(),
            ),
        )),
        Arc::new(
            StaticResourceController::new(
                "IBMBlockDriverServiceMonitorController",
                cluster,
                assets,
                substitutions,
            )
            .with_resources(&["servicemonitor.yaml"])
            .with_ignore_not_found_on_create(),
        ),
    ]
}

/// Register all controllers. Duplicate names are fatal.
pub(crate) fn register_all(
    set: &mut ControllerSet,
    controllers: Vec<Arc<dyn Controller>>,
) -> Result<(), OperatorError> {
    for controller in controllers {
        set.register(controller)?;
    }
    info!("registered controllers: {}", set.names().join(", "));
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        assets::EmbeddedAssets,
        controller_set::SyncResult,
        fake::{FakeCluster, dynamic},
    };
    use serde_json::json;

    const NAME: &str = "vpc.block.csi.ibm.io";
    const NS: &str = "openshift-cluster-csi-drivers";

    fn config() -> Configuration {
        Configuration::from_lookup(|name| {
            name.ends_with("_IMAGE")
                .then(|| format!("quay.io/test/{}", name.to_lowercase()))
        })
        .unwrap()
    }

    fn seeded_cluster() -> Arc<FakeCluster> {
        let cluster = FakeCluster::new();
        for obj in [
            json!({
                "apiVersion": "operator.openshift.io/v1",
                "kind": "ClusterCSIDriver",
                "metadata": {"name": NAME},
                "spec": {"managementState": "Managed"}
            }),
            json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {"name": "ibm-vpc-block-csi-driver-controller-metrics-serving-cert", "namespace": NS},
                "data": {"tls.crt": "Y2VydA=="}
            }),
            json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {"name": "ibm-cloud-credentials", "namespace": NS},
                "data": {"slclient.toml": "djE="}
            }),
            json!({
                "apiVersion": "apiextensions.k8s.io/v1",
                "kind": "CustomResourceDefinition",
                "metadata": {"name": VOLUME_SNAPSHOT_CLASS_CRD},
                "spec": {}
            }),
        ] {
            cluster.put(dynamic(obj));
        }
        cluster
    }

    #[test]
    fn controller_names_are_unique() {
        let cluster = seeded_cluster();
        let state = Arc::new(OperatorStateAccessor::new(cluster.clone(), cluster.clone(), NAME));
        let mut set =
            ControllerSet::new(state.clone(), cluster.clone(), cluster.clone(), Duration::from_secs(60));
        let controllers = controllers(
            &config(),
            ClusterAccess::new(cluster.clone(), cluster.clone()),
            state,
            Arc::new(EmbeddedAssets),
        );
        assert_eq!(10, controllers.len());
        register_all(&mut set, controllers).unwrap();
        assert_eq!("LogLevelController", set.names()[0]);
    }

    #[test]
    fn watches_cover_secret_sync_namespaces() {
        let watches = watches(&config());
        assert!(watches.contains(&WatchKey::new(gvk_of::<Secret>(), Some("kube-system"))));
        assert_eq!(
            1,
            watches
                .iter()
                .filter(|w| **w == WatchKey::new(gvk_of::<Secret>(), Some(NS)))
                .count()
        );
    }

    #[tokio::test]
    async fn operator_converges() {
        let cluster = seeded_cluster();
        let state = Arc::new(OperatorStateAccessor::new(cluster.clone(), cluster.clone(), NAME));
        let set =
            ControllerSet::new(state.clone(), cluster.clone(), cluster.clone(), Duration::from_secs(60));
        let controllers = controllers(
            &config(),
            ClusterAccess::new(cluster.clone(), cluster.clone()),
            state.clone(),
            Arc::new(EmbeddedAssets),
        );
        for controller in &controllers {
            assert_ne!(SyncResult::Failed, set.tick(controller.as_ref()).await, "{}", controller.name());
        }
        let driver = state.convert(&state.latest().await.unwrap()).unwrap();
        let status = driver.status.unwrap();
        for controller in &controllers {
            let degraded = status
                .condition(&format!("{}Degraded", controller.name()))
                .unwrap();
            assert!(!degraded.is_true(), "{}: {:?}", controller.name(), degraded);
        }

        cluster.clear_ops();
        for controller in &controllers {
            assert_eq!(
                SyncResult::NoChangeNeeded,
                set.tick(controller.as_ref()).await,
                "{}",
                controller.name()
            );
        }
        assert!(cluster.ops().is_empty(), "{:?}", cluster.ops());
    }
}
