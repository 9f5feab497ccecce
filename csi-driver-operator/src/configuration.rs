use std::{net::SocketAddr, time::Duration};

use crate::assets::Substitutions;

/// Operand images, each read from the environment variable of the same
/// name as its asset placeholder.
const IMAGES: &[&str] = &[
    "DRIVER_IMAGE",
    "PROVISIONER_IMAGE",
    "ATTACHER_IMAGE",
    "RESIZER_IMAGE",
    "SNAPSHOTTER_IMAGE",
    "NODE_DRIVER_REGISTRAR_IMAGE",
    "LIVENESS_PROBE_IMAGE",
    "KUBE_RBAC_PROXY_IMAGE",
];

#[derive(Clone, Debug)]
pub(crate) struct Configuration {
    /// Name of the `ClusterCSIDriver` instance.
    pub instance_name: String,
    pub operator_namespace: String,
    pub resync: Duration,
    pub workers: usize,
    pub metrics_addr: String,
    pub metrics_port: u16,
    /// `(placeholder, image)` pairs.
    pub images: Vec<(String, String)>,
    pub secret_sync_source: (String, String),
    pub secret_sync_destination: (String, String),
    pub metrics_cert_secret: String,
    pub trusted_ca_config_map: String,
}

impl Configuration {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(env_var)
    }

    /// Build the configuration from `lookup`, which returns trimmed, non-empty values.
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> anyhow::Result<Self> {
        let or = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());
        let resync_seconds: u64 = or("RESYNC_INTERVAL_SECONDS", "1200").parse()?;
        let mut images = Vec::with_capacity(IMAGES.len());
        for &variable in IMAGES {
            match lookup(variable) {
                Some(image) => images.push((variable.to_string(), image)),
                None => anyhow::bail!("environment variable {} is not set", variable),
            }
        }
        Ok(Configuration {
            instance_name: or("INSTANCE_NAME", "vpc.block.csi.ibm.io"),
            operator_namespace: or("OPERATOR_NAMESPACE", "openshift-cluster-csi-drivers"),
            resync: Duration::from_secs(resync_seconds),
            workers: or("CONTROLLER_WORKERS", "1").parse()?,
            metrics_addr: or("METRICS_LISTEN_ADDR", "0.0.0.0"),
            metrics_port: or("METRICS_LISTEN_PORT", "9000").parse()?,
            images,
            secret_sync_source: (
                or("SECRET_SYNC_SOURCE_NAMESPACE", "openshift-cluster-csi-drivers"),
                or("SECRET_SYNC_SOURCE_NAME", "ibm-cloud-credentials"),
            ),
            secret_sync_destination: (
                or("SECRET_SYNC_DESTINATION_NAMESPACE", "kube-system"),
                or("SECRET_SYNC_DESTINATION_NAME", "storage-secret-store"),
            ),
            metrics_cert_secret: or(
                "METRICS_CERT_SECRET",
                "ibm-vpc-block-csi-driver-controller-metrics-serving-cert",
            ),
            trusted_ca_config_map: or(
                "TRUSTED_CA_CONFIG_MAP",
                "ibm-vpc-block-csi-driver-trusted-ca-bundle",
            ),
        })
    }

    pub fn metrics_socket_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.metrics_addr, self.metrics_port).parse()?)
    }

    /// Placeholder values shared by all assets. `LOG_LEVEL` defaults to the
    /// `Normal` verbosity and is overridden per reconciliation by workloads.
    pub fn substitutions(&self) -> Substitutions {
        self.images
            .iter()
            .fold(Substitutions::default(), |s, (placeholder, image)| {
                s.with(placeholder, image.clone())
            })
            .with("NAMESPACE", self.operator_namespace.clone())
            .with("LOG_LEVEL", "2")
    }
}

pub(crate) fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
