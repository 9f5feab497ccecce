use std::collections::BTreeMap;

use kube::api::DynamicObject;

use crate::errors::OperatorError;

/// Source of named manifest templates.
pub(crate) trait AssetLoader: Send + Sync {
    fn read(&self, name: &str) -> Result<&'static [u8], OperatorError>;
}

macro_rules! embed {
    ($($name:literal),* $(,)?) => {
        &[$(($name, include_bytes!(concat!("../assets/", $name)) as &[u8])),*]
    };
}

const EMBEDDED: &[(&str, &[u8])] = embed![
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
    "volumesnapshotclass.yaml",
    "controller.yaml",
    "node.yaml",
    "servicemonitor.yaml",
    "storageclass/vpc-block-10iopsTier-StorageClass.yaml",
    "storageclass/vpc-block-5iopsTier-StorageClass.yaml",
    "storageclass/vpc-block-custom-StorageClass.yaml",
];

/// Manifests compiled into the operator binary.
#[derive(Clone, Copy, Default)]
pub(crate) struct EmbeddedAssets;

impl AssetLoader for EmbeddedAssets {
    fn read(&self, name: &str) -> Result<&'static [u8], OperatorError> {
        EMBEDDED
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, content)| *content)
            .ok_or_else(|| OperatorError::Asset(format!("unknown asset {}", name)))
    }
}

/// `${KEY}` placeholder values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Substitutions(BTreeMap<String, String>);

impl Substitutions {
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn apply(&self, template: &str) -> Result<String, OperatorError> {
        let mut out = template.to_string();
        for (key, value) in &self.0 {
            out = out.replace(&format!("${{{}}}", key), value);
        }
        match out.find("${") {
            Some(start) => {
                let placeholder: String = out[start..].chars().take_while(|c| *c != '}').collect();
                Err(OperatorError::Asset(format!(
                    "no value for placeholder {}}}",
                    placeholder
                )))
            }
            None => Ok(out),
        }
    }
}

/// Parse a fresh working copy of the named manifest.
pub(crate) fn render(
    loader: &dyn AssetLoader,
    name: &str,
    substitutions: &Substitutions,
) -> Result<DynamicObject, OperatorError> {
    let raw = std::str::from_utf8(loader.read(name)?)
        .map_err(|e| OperatorError::Asset(format!("asset {} is not UTF-8: {}", name, e)))?;
    let manifest = substitutions
        .apply(raw)
        .map_err(|e| OperatorError::Asset(format!("asset {}: {}", name, e)))?;
    let obj: DynamicObject = serde_yaml::from_str(manifest.as_str())?;
    if obj.types.is_none() {
        return Err(OperatorError::Asset(format!(
            "asset {} has no apiVersion/kind",
            name
        )));
    }
    Ok(obj)
}

#[cfg(test)]
pub(crate) fn test_substitutions() -> Substitutions {
    [
        "DRIVER_IMAGE",
        "PROVISIONER_IMAGE",
        "ATTACHER_IMAGE",
        "RESIZER_IMAGE",
        "SNAPSHOTTER_IMAGE",
        "NODE_DRIVER_REGISTRAR_IMAGE",
        "LIVENESS_PROBE_IMAGE",
        "KUBE_RBAC_PROXY_IMAGE",
    ]
    .iter()
    .fold(Substitutions::default(), |s, key| {
        s.with(key, format!("quay.io/test/{}:latest", key.to_lowercase()))
    })
    .with("NAMESPACE", "openshift-cluster-csi-drivers")
    .with("LOG_LEVEL", "2")
}
