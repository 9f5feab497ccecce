//! In-memory cluster with server-side apply semantics, used by unit tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{FieldsV1, ManagedFieldsEntry};
use csi_driver_operator_apis::ClusterCSIDriver;
use kube::{
    CustomResourceExt,
    api::{DynamicObject, GroupVersionKind},
};
use kube_runtime::events::EventType;
use serde_json::{Value, json};
use tokio::sync::broadcast;

use crate::{
    errors::OperatorError,
    events::EventRecorder,
    managed_fields::{
        APPLY, FIELDS_V1, FieldSet, ListKeys, STATUS_SUBRESOURCE, apply_content, merge_values,
    },
    store::{ObjectCache, ObjectKey, ObjectStore, WatchKey, broadcast_stream},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Op {
    Apply(ObjectKey, String),
    ApplyStatus(ObjectKey, String),
    Delete(ObjectKey),
}

#[derive(Default)]
struct Inner {
    objects: HashMap<ObjectKey, DynamicObject>,
    resource_version: u64,
    unserved: HashSet<GroupVersionKind>,
    ops: Vec<Op>,
    events: Vec<(String, String, String)>,
}

pub(crate) struct FakeCluster {
    inner: Mutex<Inner>,
    changes: broadcast::Sender<ObjectKey>,
}

pub(crate) fn dynamic(value: Value) -> DynamicObject {
    serde_json::from_value(value).unwrap()
}

/// List semantics per kind, as published by the API server. Lists of other
/// kinds are atomic.
pub(crate) fn list_keys(kind: &str) -> ListKeys {
    match kind {
        "ClusterCSIDriver" => {
            let crd = serde_json::to_value(ClusterCSIDriver::crd()).unwrap();
            ListKeys::from_schema(&crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"])
        }
        "Deployment" | "DaemonSet" => {
            let mut keys = ListKeys::default().with("spec.template.spec.volumes", &["name"]);
            for containers in ["spec.template.spec.containers", "spec.template.spec.initContainers"] {
                keys = keys
                    .with(containers, &["name"])
                    .with(&format!("{}.env", containers), &["name"])
                    .with(&format!("{}.ports", containers), &["containerPort", "protocol"])
                    .with(&format!("{}.volumeMounts", containers), &["mountPath"]);
            }
            keys
        }
        "Service" => ListKeys::default().with("spec.ports", &["port", "protocol"]),
        _ => ListKeys::default(),
    }
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        let (changes, _) = broadcast::channel(1024);
        Arc::new(Self {
            inner: Default::default(),
            changes,
        })
    }

    fn commit(&self, inner: &mut Inner, key: ObjectKey, mut obj: DynamicObject) -> DynamicObject {
        inner.resource_version += 1;
        obj.metadata.resource_version = Some(inner.resource_version.to_string());
        inner.objects.insert(key.clone(), obj.clone());
        let _ = self.changes.send(key);
        obj
    }

    /// Store `obj` as is, bypassing field management.
    pub fn put(&self, obj: DynamicObject) -> DynamicObject {
        let key = ObjectKey::of(&obj).unwrap();
        let mut inner = self.inner.lock().unwrap();
        self.commit(&mut inner, key, obj)
    }

    pub fn object(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.inner.lock().unwrap().objects.get(key).cloned()
    }

    /// Make the API server answer 404 for the given kind, like a missing CRD.
    pub fn unserve(&self, gvk: GroupVersionKind) {
        self.inner.lock().unwrap().unserved.insert(gvk);
    }

    pub fn ops(&self) -> Vec<Op> {
        self.inner.lock().unwrap().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.inner.lock().unwrap().ops.clear();
    }

    pub fn apply_count(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, Op::Apply(..) | Op::ApplyStatus(..)))
            .count()
    }

    pub fn delete_count(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, Op::Delete(..)))
            .count()
    }

    /// Recorded events as (type, reason, message).
    pub fn events(&self) -> Vec<(String, String, String)> {
        self.inner.lock().unwrap().events.clone()
    }

    fn server_side_apply(
        &self,
        object: DynamicObject,
        manager: &str,
        subresource: Option<&str>,
        force: bool,
    ) -> Result<DynamicObject, OperatorError> {
        let key = ObjectKey::of(&object)?;
        let mut inner = self.inner.lock().unwrap();
        if inner.unserved.contains(&key.gvk) {
            return Err(OperatorError::NotFound(format!(
                "the server could not find the requested resource ({})",
                key.gvk.kind
            )));
        }
        let mut content = apply_content(&object)?;
        if let Some(map) = content.as_object_mut() {
            match subresource {
                Some(_) => map.retain(|k, _| k == "status"),
                None => {
                    map.remove("status");
                }
            }
        }
        let lists = list_keys(&key.gvk.kind);
        let applied = match content.as_object() {
            Some(map) if map.is_empty() => FieldSet::default(),
            _ => FieldSet::from_value(&content, &lists),
        };
        let live = inner.objects.get(&key).cloned();
        let (mut value, live_content, mut entries) = match &live {
            Some(live) => (
                serde_json::to_value(live)?,
                apply_content(live)?,
                live.metadata.managed_fields.clone().unwrap_or_default(),
            ),
            None if subresource.is_some() => {
                return Err(OperatorError::NotFound(format!("{} not found", key)));
            }
            None => {
                let types = object.types.clone().unwrap();
                let mut value = json!({
                    "apiVersion": types.api_version,
                    "kind": types.kind,
                    "metadata": {"name": key.name},
                });
                if let Some(ns) = &key.namespace {
                    value["metadata"]["namespace"] = json!(ns);
                }
                (value, json!({}), vec![])
            }
        };

        let same_subresource =
            |e: &ManagedFieldsEntry| e.subresource.as_deref().filter(|s| !s.is_empty()) == subresource;
        let mut previous = FieldSet::default();
        let mut others = FieldSet::default();
        for entry in entries.iter_mut().filter(|e| same_subresource(e)) {
            let mut set = match &entry.fields_v1 {
                Some(fields) => FieldSet::from_fields_v1(&fields.0)?,
                None => continue,
            };
            if entry.manager.as_deref() == Some(manager) {
                if entry.operation.as_deref() == Some(APPLY) {
                    previous.union(&set);
                }
                continue;
            }
            let common = applied.intersection(&set);
            if !common.is_empty() && common.project(&content)? != common.project(&live_content)? {
                if !force {
                    return Err(OperatorError::Conflict(format!(
                        "Apply failed with 1 conflict: conflict with \"{}\"",
                        entry.manager.as_deref().unwrap_or_default()
                    )));
                }
                set = set.difference(&common);
                entry.fields_v1 = Some(FieldsV1(set.to_fields_v1()));
            }
            others.union(&set);
        }

        previous.difference(&applied).difference(&others).remove_from(&mut value);
        merge_values(&mut value, &content, &lists);

        entries.retain(|e| {
            !(same_subresource(e) && e.manager.as_deref() == Some(manager))
                && e.fields_v1.as_ref().map_or(true, |f| f.0 != json!({}))
        });
        if !applied.is_empty() {
            entries.push(ManagedFieldsEntry {
                manager: Some(manager.to_string()),
                operation: Some(APPLY.to_string()),
                subresource: subresource.map(|s| s.to_string()),
                fields_type: Some(FIELDS_V1.to_string()),
                fields_v1: Some(FieldsV1(applied.to_fields_v1())),
                api_version: object.types.as_ref().map(|t| t.api_version.clone()),
                ..Default::default()
            });
        }
        let mut stored: DynamicObject = serde_json::from_value(value)?;
        stored.metadata.managed_fields = Some(entries);
        inner.ops.push(match subresource {
            Some(_) => Op::ApplyStatus(key.clone(), manager.to_string()),
            None => Op::Apply(key.clone(), manager.to_string()),
        });
        Ok(self.commit(&mut inner, key, stored))
    }
}

#[async_trait]
impl ObjectStore for FakeCluster {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, OperatorError> {
        let inner = self.inner.lock().unwrap();
        if inner.unserved.contains(&key.gvk) {
            return Ok(None);
        }
        Ok(inner.objects.get(key).cloned())
    }

    async fn apply(
        &self,
        object: DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject, OperatorError> {
        self.server_side_apply(object, field_manager, None, true)
    }

    async fn apply_status(
        &self,
        object: DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject, OperatorError> {
        self.server_side_apply(object, field_manager, Some(STATUS_SUBRESOURCE), false)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool, OperatorError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.objects.remove(key) {
            Some(_) => {
                inner.ops.push(Op::Delete(key.clone()));
                let _ = self.changes.send(key.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl ObjectCache for FakeCluster {
    fn get(&self, key: &ObjectKey) -> Option<Arc<DynamicObject>> {
        self.object(key).map(Arc::new)
    }

    fn list(&self, watch: &WatchKey) -> Vec<Arc<DynamicObject>> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .iter()
            .filter(|(k, _)| watch.covers(k))
            .map(|(_, o)| Arc::new(o.clone()))
            .collect()
    }

    fn subscribe(&self, watch: &WatchKey) -> BoxStream<'static, ()> {
        let watch = watch.clone();
        broadcast_stream(self.changes.subscribe())
            .filter(move |key| futures::future::ready(watch.covers(key)))
            .map(|_| ())
            .boxed()
    }
}

impl EventRecorder for FakeCluster {
    fn event(&self, type_: EventType, reason: &str, message: String) {
        self.inner.lock().unwrap().events.push((
            format!("{:?}", type_),
            reason.to_string(),
            message,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managed_fields::last_applied;

    fn config_map(data: Value) -> DynamicObject {
        dynamic(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "ns"},
            "data": data
        }))
    }

    #[tokio::test]
    async fn apply_prunes_fields_no_longer_applied() {
        let cluster = FakeCluster::new();
        cluster.apply(config_map(json!({"a": "1", "b": "2"})), "m").await.unwrap();
        let obj = cluster.apply(config_map(json!({"a": "1"})), "m").await.unwrap();
        assert_eq!(json!({"a": "1"}), obj.data["data"]);
        assert_eq!(
            Some(json!({"data": {"a": "1"}})),
            last_applied(&obj, "m").unwrap()
        );
        assert_eq!(Some("2"), obj.metadata.resource_version.as_deref());
    }

    #[tokio::test]
    async fn fields_of_other_managers_are_kept() {
        let cluster = FakeCluster::new();
        cluster.apply(config_map(json!({"a": "1"})), "m").await.unwrap();
        cluster.apply(config_map(json!({"b": "2"})), "n").await.unwrap();
        let obj = cluster.apply(config_map(json!({"c": "3"})), "m").await.unwrap();
        assert_eq!(json!({"b": "2", "c": "3"}), obj.data["data"]);
    }

    #[tokio::test]
    async fn status_apply_does_not_force() {
        let cluster = FakeCluster::new();
        let status = |v: &str| {
            dynamic(json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "cm", "namespace": "ns"},
                "status": {"phase": v}
            }))
        };
        assert!(cluster.apply_status(status("a"), "m").await.unwrap_err().is_not_found());
        cluster.apply(config_map(json!({"a": "1"})), "m").await.unwrap();
        cluster.apply_status(status("a"), "m").await.unwrap();
        // same value, shared ownership
        cluster.apply_status(status("a"), "n").await.unwrap();
        assert!(cluster.apply_status(status("b"), "n").await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn driver_conditions_are_merged_by_type() {
        let cluster = FakeCluster::new();
        let driver = |status: Value| {
            dynamic(json!({
                "apiVersion": "operator.openshift.io/v1",
                "kind": "ClusterCSIDriver",
                "metadata": {"name": "driver"},
                "spec": {"logLevel": "Normal"},
                "status": status
            }))
        };
        cluster.apply(driver(json!({})), "creator").await.unwrap();
        cluster
            .apply_status(driver(json!({"conditions": [{"type": "A", "status": "True"}]})), "a")
            .await
            .unwrap();
        let obj = cluster
            .apply_status(driver(json!({"conditions": [{"type": "B", "status": "False"}]})), "b")
            .await
            .unwrap();
        assert_eq!(
            json!([{"type": "A", "status": "True"}, {"type": "B", "status": "False"}]),
            obj.data["status"]["conditions"]
        );
    }

    #[tokio::test]
    async fn atomic_lists_conflict_between_managers() {
        let cluster = FakeCluster::new();
        let status = |tpe: &str| {
            dynamic(json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "cm", "namespace": "ns"},
                "status": {"conditions": [{"type": tpe, "status": "True"}]}
            }))
        };
        cluster.apply(config_map(json!({"a": "1"})), "m").await.unwrap();
        cluster.apply_status(status("A"), "a").await.unwrap();
        assert!(cluster.apply_status(status("B"), "b").await.unwrap_err().is_conflict());
    }
}
