use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use futures::{StreamExt, future::join_all, stream::BoxStream};
use kube::{
    Api, Client, ResourceExt,
    api::{ApiResource, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams},
};
use kube_runtime::{
    WatchStreamExt,
    reflector::{ObjectRef, Store, reflector, store::Writer},
    watcher,
};
use tokio::sync::broadcast;

use crate::{
    errors::{ExtKubeApiError, OperatorError},
    utils::split_api_version,
};

/// Identity of a single Kubernetes object.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ObjectKey {
    pub gvk: GroupVersionKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(gvk: GroupVersionKind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            gvk,
            namespace: namespace.filter(|ns| !ns.is_empty()).map(|ns| ns.to_string()),
            name: name.to_string(),
        }
    }

    /// Key of an object carrying type information, e.g. a parsed manifest.
    pub fn of(obj: &DynamicObject) -> Result<Self, OperatorError> {
        let types = obj.types.as_ref().ok_or_else(|| {
            OperatorError::Asset(format!(
                "object {} has no apiVersion/kind",
                obj.name_any()
            ))
        })?;
        let (group, version) = split_api_version(types.api_version.as_str());
        Ok(Self::new(
            GroupVersionKind::gvk(group, version, types.kind.as_str()),
            obj.metadata.namespace.as_deref(),
            obj.name_any().as_str(),
        ))
    }

    pub fn watch_key(&self) -> WatchKey {
        WatchKey {
            gvk: self.gvk.clone(),
            namespace: self.namespace.clone(),
        }
    }

    fn api(&self, client: Client) -> Api<DynamicObject> {
        let api_resource = ApiResource::from_gvk(&self.gvk);
        match &self.namespace {
            Some(ns) => Api::namespaced_with(client, ns.as_str(), &api_resource),
            None => Api::all_with(client, &api_resource),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}",
            self.gvk.kind,
            self.namespace.as_deref().unwrap_or(""),
            self.name
        )
    }
}

/// A (kind, namespace) pair the cache maintains; `namespace == None` covers
/// cluster scoped kinds and all namespaces.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct WatchKey {
    pub gvk: GroupVersionKind,
    pub namespace: Option<String>,
}

impl WatchKey {
    pub fn new(gvk: GroupVersionKind, namespace: Option<&str>) -> Self {
        Self {
            gvk,
            namespace: namespace.filter(|ns| !ns.is_empty()).map(|ns| ns.to_string()),
        }
    }

    /// Whether an object identified by `key` is maintained under this watch.
    pub fn covers(&self, key: &ObjectKey) -> bool {
        self.gvk == key.gvk && (self.namespace.is_none() || self.namespace == key.namespace)
    }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} in {}",
            self.gvk.group,
            self.gvk.version,
            self.gvk.kind,
            self.namespace.as_deref().unwrap_or("*")
        )
    }
}

/// The authoritative object store.
#[async_trait]
pub(crate) trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, OperatorError>;

    /// Server-side apply of `object`, taking ownership of conflicting fields.
    async fn apply(
        &self,
        object: DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject, OperatorError>;

    /// Server-side apply on the status subresource; fails with
    /// [`OperatorError::Conflict`] if other managers own the applied fields.
    async fn apply_status(
        &self,
        object: DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject, OperatorError>;

    /// Delete an object, `Ok(false)` if it did not exist.
    async fn delete(&self, key: &ObjectKey) -> Result<bool, OperatorError>;
}

/// Read-shared, watch-maintained view of cluster objects.
pub(crate) trait ObjectCache: Send + Sync {
    fn get(&self, key: &ObjectKey) -> Option<Arc<DynamicObject>>;

    fn list(&self, watch: &WatchKey) -> Vec<Arc<DynamicObject>>;

    /// Change notifications for the objects maintained under `watch`.
    fn subscribe(&self, watch: &WatchKey) -> BoxStream<'static, ()>;
}

pub(crate) struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn map_kube_error(key: &ObjectKey, e: kube::Error) -> OperatorError {
    if e.is_conflict() {
        OperatorError::Conflict(format!("conflict while applying {}: {}", key, e))
    } else if e.is_not_found() {
        OperatorError::NotFound(format!("{} not found: {}", key, e))
    } else {
        OperatorError::KubeApi(e)
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, OperatorError> {
        let api = key.api(self.client.clone());
        match api.get(key.name.as_str()).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e)?,
        }
    }

    async fn apply(
        &self,
        object: DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject, OperatorError> {
        let key = ObjectKey::of(&object)?;
        let api = key.api(self.client.clone());
        let pp = PatchParams::apply(field_manager).force();
        api.patch(key.name.as_str(), &pp, &Patch::Apply(&object))
            .await
            .map_err(|e| map_kube_error(&key, e))
    }

    async fn apply_status(
        &self,
        object: DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject, OperatorError> {
        let key = ObjectKey::of(&object)?;
        let api = key.api(self.client.clone());
        let pp = PatchParams::apply(field_manager);
        api.patch_status(key.name.as_str(), &pp, &Patch::Apply(&object))
            .await
            .map_err(|e| map_kube_error(&key, e))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool, OperatorError> {
        let api = key.api(self.client.clone());
        match api.delete(key.name.as_str(), &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e)?,
        }
    }
}

struct Informer {
    api_resource: ApiResource,
    store: Store<DynamicObject>,
    changes: broadcast::Sender<()>,
}

/// [`ObjectCache`] backed by one reflector per watched (kind, namespace).
pub(crate) struct KubeObjectCache {
    informers: HashMap<WatchKey, Informer>,
}

pub(crate) struct KubeObjectCacheBuilder {
    client: Client,
    watches: Vec<WatchKey>,
}

impl KubeObjectCacheBuilder {
    pub fn watch(mut self, watch: WatchKey) -> Self {
        if !self.watches.contains(&watch) {
            self.watches.push(watch);
        }
        self
    }

    /// Build the cache together with the future which drives its watches.
    pub fn build(self) -> (Arc<KubeObjectCache>, impl Future<Output = ()>) {
        let mut informers = HashMap::new();
        let mut streams = Vec::new();
        for watch in self.watches {
            let api_resource = ApiResource::from_gvk(&watch.gvk);
            let api: Api<DynamicObject> = match &watch.namespace {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns.as_str(), &api_resource),
                None => Api::all_with(self.client.clone(), &api_resource),
            };
            let writer: Writer<DynamicObject> = Writer::new(api_resource.clone());
            let store = writer.as_reader();
            let (changes, _) = broadcast::channel(16);
            let tx = changes.clone();
            let name = watch.to_string();
            let stream = reflector(writer, watcher(api, watcher::Config::default()))
                .default_backoff()
                .touched_objects()
                .for_each(move |event| {
                    match event {
                        Ok(_) => {
                            // no receivers is fine
                            let _ = tx.send(());
                        }
                        Err(e) => warn!("watch of {} failed: {}", name, e),
                    }
                    futures::future::ready(())
                });
            streams.push(stream);
            informers.insert(
                watch,
                Informer {
                    api_resource,
                    store,
                    changes,
                },
            );
        }
        let cache = Arc::new(KubeObjectCache { informers });
        let driver = async move {
            join_all(streams).await;
        };
        (cache, driver)
    }
}

impl KubeObjectCache {
    pub fn builder(client: Client) -> KubeObjectCacheBuilder {
        KubeObjectCacheBuilder {
            client,
            watches: Default::default(),
        }
    }

    fn informer_for(&self, key: &ObjectKey) -> Option<&Informer> {
        self.informers
            .get(&key.watch_key())
            .or_else(|| self.informers.get(&WatchKey::new(key.gvk.clone(), None)))
    }
}

impl ObjectCache for KubeObjectCache {
    fn get(&self, key: &ObjectKey) -> Option<Arc<DynamicObject>> {
        let informer = match self.informer_for(key) {
            Some(informer) => informer,
            None => {
                debug!("no informer maintains {}", key);
                return None;
            }
        };
        let mut object_ref =
            ObjectRef::<DynamicObject>::new_with(key.name.as_str(), informer.api_resource.clone());
        if let Some(ns) = &key.namespace {
            object_ref = object_ref.within(ns.as_str());
        }
        informer.store.get(&object_ref)
    }

    fn list(&self, watch: &WatchKey) -> Vec<Arc<DynamicObject>> {
        match self.informers.get(watch) {
            Some(informer) => informer.store.state(),
            None => match self.informers.get(&WatchKey::new(watch.gvk.clone(), None)) {
                Some(informer) => informer
                    .store
                    .state()
                    .into_iter()
                    .filter(|o| watch.namespace.is_none() || o.namespace() == watch.namespace)
                    .collect(),
                None => vec![],
            },
        }
    }

    fn subscribe(&self, watch: &WatchKey) -> BoxStream<'static, ()> {
        match self.informers.get(watch) {
            Some(informer) => broadcast_stream(informer.changes.subscribe()),
            None => {
                warn!("no informer registered for {}, subscription never fires", watch);
                futures::stream::pending().boxed()
            }
        }
    }
}

/// Turn a broadcast receiver into a stream of notifications; lagging
/// receivers see a single notification for all missed ones.
pub(crate) fn broadcast_stream<T: Clone + Send + 'static>(
    rx: broadcast::Receiver<T>,
) -> BoxStream<'static, T> {
    futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(v) => return Some((v, rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
