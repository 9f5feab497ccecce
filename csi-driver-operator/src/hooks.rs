//! Manifest hooks: pure functions of the operator spec and observed cluster
//! state, applied in order to a freshly parsed manifest before it is applied.

use std::{collections::BTreeMap, sync::Arc};

use csi_driver_operator_apis::OperatorSpec;
use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment},
    core::v1::{ConfigMap, EnvVar, Node, PodTemplateSpec, Secret, Volume, VolumeMount},
    storage::v1::StorageClass,
};
use kube::Resource;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;

use crate::{
    errors::OperatorError,
    store::{ObjectCache, ObjectKey, WatchKey},
    utils::{from_dynamic, gvk_of, secret_data_hash, string_hash},
};

pub(crate) type ManifestHook<M> =
    Box<dyn Fn(&OperatorSpec, M) -> Result<M, OperatorError> + Send + Sync>;

/// Box a closure as a [`ManifestHook`].
pub(crate) fn manifest_hook<M, F>(f: F) -> ManifestHook<M>
where
    F: Fn(&OperatorSpec, M) -> Result<M, OperatorError> + Send + Sync + 'static,
{
    Box::new(f)
}

/// Named hooks, run left to right, each receiving the previous hook's output.
pub(crate) struct HookPipeline<M> {
    hooks: Vec<(String, ManifestHook<M>)>,
}

impl<M> Default for HookPipeline<M> {
    fn default() -> Self {
        Self { hooks: vec![] }
    }
}

impl<M> HookPipeline<M> {
    pub fn with(mut self, name: &str, hook: ManifestHook<M>) -> Self {
        self.hooks.push((name.to_string(), hook));
        self
    }

    pub fn run(&self, spec: &OperatorSpec, manifest: M) -> Result<M, OperatorError> {
        self.hooks.iter().try_fold(manifest, |manifest, (name, hook)| {
            hook(spec, manifest).map_err(|e| OperatorError::Hook(format!("{} hook: {}", name, e)))
        })
    }
}

/// Rollout progress of a workload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Rollout {
    pub desired: i32,
    pub available: i32,
    pub updated: i32,
    /// The workload controller reported a status for the latest generation.
    pub observed: bool,
}

/// A workload with a pod template.
pub(crate) trait Workload:
    Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec>;

    fn rollout(&self) -> Rollout;
}

impl Workload for Deployment {
    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|s| &mut s.template)
    }

    fn rollout(&self) -> Rollout {
        let reported = self.status.is_some();
        let status = self.status.clone().unwrap_or_default();
        Rollout {
            desired: self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
            available: status.available_replicas.unwrap_or_default(),
            updated: status.updated_replicas.unwrap_or_default(),
            observed: reported && status.observed_generation >= self.metadata.generation,
        }
    }
}

impl Workload for DaemonSet {
    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|s| &mut s.template)
    }

    fn rollout(&self) -> Rollout {
        let reported = self.status.is_some();
        let status = self.status.clone().unwrap_or_default();
        Rollout {
            desired: status.desired_number_scheduled,
            available: status.number_available.unwrap_or_default(),
            updated: status.updated_number_scheduled.unwrap_or_default(),
            observed: reported && status.observed_generation >= self.metadata.generation,
        }
    }
}

fn template_annotations(template: &mut PodTemplateSpec) -> &mut BTreeMap<String, String> {
    template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(Default::default)
}

/// Set the observed proxy variables on every container, replacing same-named ones.
pub(crate) fn observed_proxy_hook<W: Workload>() -> ManifestHook<W> {
    manifest_hook(|spec, mut workload: W| {
        let proxy = spec.observed_proxy();
        if proxy.is_empty() {
            return Ok(workload);
        }
        if let Some(pod) = workload.pod_template_mut().and_then(|t| t.spec.as_mut()) {
            for container in pod.containers.iter_mut() {
                let env = container.env.get_or_insert_with(Default::default);
                env.retain(|e| !proxy.contains_key(&e.name));
                env.extend(proxy.iter().map(|(name, value)| EnvVar {
                    name: name.clone(),
                    value: Some(value.clone()),
                    ..Default::default()
                }));
            }
        }
        Ok(workload)
    })
}

/// Pod template annotation carrying the content hash of a secret.
pub(crate) fn secret_hash_annotation(namespace: &str, name: &str) -> String {
    let id = string_hash(format!("secret/{}/{}", namespace, name).as_str());
    format!("operator.openshift.io/dep-{}", &id[..16])
}

/// Annotate the pod template with the hash of a secret, so pods restart when
/// it changes. A missing secret fails the hook.
pub(crate) fn secret_hash_hook<W: Workload>(
    cache: Arc<dyn ObjectCache>,
    namespace: &str,
    name: &str,
) -> ManifestHook<W> {
    let key = ObjectKey::new(gvk_of::<Secret>(), Some(namespace), name);
    let annotation = secret_hash_annotation(namespace, name);
    manifest_hook(move |_, mut workload: W| {
        let secret: Secret = match cache.get(&key) {
            Some(obj) => from_dynamic(&obj)?,
            None => {
                return Err(OperatorError::Hook(format!("{} not found", key)));
            }
        };
        if let Some(template) = workload.pod_template_mut() {
            template_annotations(template)
                .insert(annotation.clone(), secret_data_hash(secret.data.as_ref()));
        }
        Ok(workload)
    })
}

pub(crate) const CA_BUNDLE_KEY: &'static str = "ca-bundle.crt";
const CA_BUNDLE_VOLUME: &'static str = "non-standard-root-system-trust-ca-bundle";
const CA_BUNDLE_MOUNT_PATH: &'static str = "/etc/pki/ca-trust/extracted/pem";
pub(crate) const CA_BUNDLE_HASH_ANNOTATION: &'static str =
    "operator.openshift.io/trusted-ca-bundle-hash";

/// Mount the trusted CA bundle into every container once it has been injected
/// into the config map; a no-op before.
pub(crate) fn ca_bundle_hook<W: Workload>(
    cache: Arc<dyn ObjectCache>,
    namespace: &str,
    name: &str,
) -> ManifestHook<W> {
    let key = ObjectKey::new(gvk_of::<ConfigMap>(), Some(namespace), name);
    let name = name.to_string();
    manifest_hook(move |_, mut workload: W| {
        let config_map: ConfigMap = match cache.get(&key) {
            Some(obj) => from_dynamic(&obj)?,
            None => return Ok(workload),
        };
        let bundle = match config_map.data.as_ref().and_then(|d| d.get(CA_BUNDLE_KEY)) {
            Some(bundle) if !bundle.is_empty() => bundle,
            _ => return Ok(workload),
        };
        let volume: Volume = serde_json::from_value(json!({
            "name": CA_BUNDLE_VOLUME,
            "configMap": {
                "name": name,
                "items": [{"key": CA_BUNDLE_KEY, "path": "tls-ca-bundle.pem"}]
            }
        }))?;
        if let Some(template) = workload.pod_template_mut() {
            template_annotations(template)
                .insert(CA_BUNDLE_HASH_ANNOTATION.to_string(), string_hash(bundle));
            if let Some(pod) = template.spec.as_mut() {
                let volumes = pod.volumes.get_or_insert_with(Default::default);
                volumes.retain(|v| v.name != CA_BUNDLE_VOLUME);
                volumes.push(volume);
                for container in pod.containers.iter_mut() {
                    let mounts = container.volume_mounts.get_or_insert_with(Default::default);
                    mounts.retain(|m| m.name != CA_BUNDLE_VOLUME);
                    mounts.push(VolumeMount {
                        name: CA_BUNDLE_VOLUME.to_string(),
                        mount_path: CA_BUNDLE_MOUNT_PATH.to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    });
                }
            }
        }
        Ok(workload)
    })
}

const CONTROL_PLANE_LABELS: &[&str] = &[
    "node-role.kubernetes.io/master",
    "node-role.kubernetes.io/control-plane",
];

/// One replica on single control-plane clusters, two otherwise.
pub(crate) fn replicas_hook(cache: Arc<dyn ObjectCache>) -> ManifestHook<Deployment> {
    let nodes = WatchKey::new(gvk_of::<Node>(), None);
    manifest_hook(move |_, mut deployment: Deployment| {
        let control_plane = cache
            .list(&nodes)
            .iter()
            .filter(|n| {
                n.metadata
                    .labels
                    .as_ref()
                    .map_or(false, |l| CONTROL_PLANE_LABELS.iter().any(|k| l.contains_key(*k)))
            })
            .count();
        if let Some(spec) = deployment.spec.as_mut() {
            spec.replicas = Some(if control_plane < 2 { 1 } else { 2 });
        }
        Ok(deployment)
    })
}

const ENCRYPTED_PARAMETER: &'static str = "encrypted";
const ENCRYPTION_KEY_PARAMETER: &'static str = "encryptionKey";

/// Encrypt volumes of a storage class with the configured key, if any.
pub(crate) fn encryption_key_hook() -> ManifestHook<StorageClass> {
    manifest_hook(|spec, mut storage_class: StorageClass| {
        if let Some(crn) = spec.encryption_key_crn() {
            let parameters = storage_class.parameters.get_or_insert_with(Default::default);
            parameters.insert(ENCRYPTED_PARAMETER.to_string(), "true".to_string());
            parameters.insert(ENCRYPTION_KEY_PARAMETER.to_string(), crn.to_string());
        }
        Ok(storage_class)
    })
}
