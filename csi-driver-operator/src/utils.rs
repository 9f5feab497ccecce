use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use kube::{
    Resource,
    api::{DynamicObject, GroupVersionKind},
};
use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};

use crate::errors::OperatorError;

pub(crate) fn metric_name(name: &str) -> String {
    format!("csi_driver_operator_{}", name)
}

/// The [`GroupVersionKind`] of a statically typed Kubernetes resource.
pub(crate) fn gvk_of<K: Resource<DynamicType = ()>>() -> GroupVersionKind {
    GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()))
}

/// Split an `apiVersion` into group and version, the core group is `""`.
pub(crate) fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

pub(crate) fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject, OperatorError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

pub(crate) fn from_dynamic<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K, OperatorError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Stable SHA-256 content hash of secret data, independent of map ordering.
pub(crate) fn secret_data_hash(data: Option<&BTreeMap<String, ByteString>>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in data.into_iter().flatten() {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(&value.0);
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

pub(crate) fn string_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}
