use async_trait::async_trait;
use futures_util::stream::BoxStream;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, Resource};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

use crate::error::{Error, Result};

pub const DEFAULT_FIELD_MANAGER: &str = "app-reconciler";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Secret,
    Service,
    StatefulSet,
    Deployment,
    DaemonSet,
    PersistentVolumeClaim,
    StorageClass,
    Pod,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Debug::fmt(self, f) }
}

/// A typed object that can be staged into a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Secret(Secret),
    Service(Service),
    StatefulSet(StatefulSet),
    Deployment(Deployment),
    DaemonSet(DaemonSet),
    PersistentVolumeClaim(PersistentVolumeClaim),
    StorageClass(StorageClass),
}

impl Object {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Secret(_) => ResourceKind::Secret,
            Self::Service(_) => ResourceKind::Service,
            Self::StatefulSet(_) => ResourceKind::StatefulSet,
            Self::Deployment(_) => ResourceKind::Deployment,
            Self::DaemonSet(_) => ResourceKind::DaemonSet,
            Self::PersistentVolumeClaim(_) => ResourceKind::PersistentVolumeClaim,
            Self::StorageClass(_) => ResourceKind::StorageClass,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::Secret(o) => o.meta(),
            Self::Service(o) => o.meta(),
            Self::StatefulSet(o) => o.meta(),
            Self::Deployment(o) => o.meta(),
            Self::DaemonSet(o) => o.meta(),
            Self::PersistentVolumeClaim(o) => o.meta(),
            Self::StorageClass(o) => o.meta(),
        }
    }

    pub fn name(&self) -> &str { self.meta().name.as_deref().unwrap_or_default() }

    pub fn to_ref(&self) -> ObjectRef {
        ObjectRef { kind: self.kind(), name: self.name().to_string(), namespace: self.meta().namespace.clone() }
    }
}

/// Identifies an object to delete.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: Option<String>,
}

impl ObjectRef {
    pub fn namespaced(kind: ResourceKind, namespace: &str, name: &str) -> Self {
        Self { kind, name: name.to_string(), namespace: Some(namespace.to_string()) }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodListParams {
    pub label_selector: String,
    pub continue_token: Option<String>,
}

/// One page of a pod listing.
#[derive(Debug, Clone, Default)]
pub struct PodPage {
    pub items: Vec<Pod>,
    pub continue_token: Option<String>,
    pub remaining_item_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchSelector {
    Fields(String),
    Labels(String),
}

/// The slice of the Kubernetes API the engine consumes.
///
/// Every `get_*` reports an absent object as `Error::NotFound`.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service>;
    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<StatefulSet>;
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment>;
    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<DaemonSet>;
    async fn get_persistent_volume_claim(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim>;
    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>>;
    async fn list_pods(&self, namespace: &str, params: &PodListParams) -> Result<PodPage>;
    /// Create or update one object.
    async fn upsert(&self, object: &Object, dry_run: bool) -> Result<()>;
    /// Delete one object; an absent object is reported as `NotFound`.
    async fn remove(&self, target: &ObjectRef, dry_run: bool) -> Result<()>;
    /// Change notifications for objects of `kind` matching `selector`.
    fn watch(&self, kind: ResourceKind, namespace: &str, selector: WatchSelector) -> Result<BoxStream<'static, Result<()>>>;
}

/// `ClusterClient` backed by a live API server.
#[derive(Clone)]
pub struct KubeCluster {
    pub(crate) client: Client,
    field_manager: String,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self { Self { client, field_manager: DEFAULT_FIELD_MANAGER.to_string() } }

    pub async fn try_default() -> Result<Self> { Ok(Self::new(Client::try_default().await?)) }

    pub fn with_field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    async fn get_named<K>(&self, namespace: &str, name: &str) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(|e| classify(e, &K::kind(&()), name))
    }

    async fn apply_namespaced<K>(&self, obj: &K, dry_run: bool) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Serialize + fmt::Debug,
    {
        let kind = K::kind(&());
        let name = obj.meta().name.as_deref().ok_or_else(|| Error::not_valid(format!("{kind} without a name")))?;
        let namespace = obj.meta().namespace.as_deref()
            .ok_or_else(|| Error::not_valid(format!("{kind} {name:?} without a namespace")))?;
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let desired = for_apply(obj.clone());
        api.patch(name, &self.patch_params(dry_run), &Patch::Apply(&desired)).await
            .map_err(|e| classify(e, &kind, name))?;
        Ok(())
    }

    async fn delete_namespaced<K>(&self, namespace: &str, name: &str, dry_run: bool) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let mut params = DeleteParams::background();
        params.dry_run = dry_run;
        api.delete(name, &params).await.map(|_| ()).map_err(|e| classify(e, &K::kind(&()), name))
    }

    fn patch_params(&self, dry_run: bool) -> PatchParams {
        let mut params = PatchParams::apply(&self.field_manager).force();
        params.dry_run = dry_run;
        params
    }
}

/// Server-side apply rejects bodies that carry server-owned bookkeeping.
fn for_apply<K: Resource>(mut obj: K) -> K {
    let meta = obj.meta_mut();
    meta.managed_fields = None;
    meta.resource_version = None;
    obj
}

pub(crate) fn classify(err: kube::Error, kind: &str, name: &str) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(format!("{} {:?}", kind.to_lowercase(), name)),
        other => Error::Kube(other),
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> { self.get_named(namespace, name).await }
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> { self.get_named(namespace, name).await }
    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<StatefulSet> { self.get_named(namespace, name).await }
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> { self.get_named(namespace, name).await }
    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<DaemonSet> { self.get_named(namespace, name).await }
    async fn get_persistent_volume_claim(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim> {
        self.get_named(namespace, name).await
    }

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_pods(&self, namespace: &str, params: &PodListParams) -> Result<PodPage> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut lp = ListParams::default().labels(&params.label_selector);
        if let Some(token) = params.continue_token.as_deref().filter(|t| !t.is_empty()) {
            lp = lp.continue_token(token);
        }
        let list = api.list(&lp).await?;
        Ok(PodPage {
            items: list.items,
            continue_token: list.metadata.continue_,
            remaining_item_count: list.metadata.remaining_item_count,
        })
    }

    async fn upsert(&self, object: &Object, dry_run: bool) -> Result<()> {
        match object {
            Object::Secret(o) => self.apply_namespaced(o, dry_run).await,
            Object::Service(o) => self.apply_namespaced(o, dry_run).await,
            Object::StatefulSet(o) => self.apply_namespaced(o, dry_run).await,
            Object::Deployment(o) => self.apply_namespaced(o, dry_run).await,
            Object::DaemonSet(o) => self.apply_namespaced(o, dry_run).await,
            Object::PersistentVolumeClaim(o) => self.apply_namespaced(o, dry_run).await,
            Object::StorageClass(o) => {
                let name = o.metadata.name.as_deref().ok_or_else(|| Error::not_valid("storage class without a name"))?;
                let api: Api<StorageClass> = Api::all(self.client.clone());
                let desired = for_apply(o.clone());
                api.patch(name, &self.patch_params(dry_run), &Patch::Apply(&desired)).await
                    .map_err(|e| classify(e, "StorageClass", name))?;
                Ok(())
            }
        }
    }

    async fn remove(&self, target: &ObjectRef, dry_run: bool) -> Result<()> {
        let name = target.name.as_str();
        let namespace = target.namespace.as_deref()
            .ok_or_else(|| Error::not_valid(format!("{target} without a namespace")))?;
        match target.kind {
            ResourceKind::Secret => self.delete_namespaced::<Secret>(namespace, name, dry_run).await,
            ResourceKind::Service => self.delete_namespaced::<Service>(namespace, name, dry_run).await,
            ResourceKind::StatefulSet => self.delete_namespaced::<StatefulSet>(namespace, name, dry_run).await,
            ResourceKind::Deployment => self.delete_namespaced::<Deployment>(namespace, name, dry_run).await,
            ResourceKind::DaemonSet => self.delete_namespaced::<DaemonSet>(namespace, name, dry_run).await,
            // storage outlives the application; pods go with their workload
            other => Err(Error::not_supported(format!("deleting {other}"))),
        }
    }

    fn watch(&self, kind: ResourceKind, namespace: &str, selector: WatchSelector) -> Result<BoxStream<'static, Result<()>>> {
        crate::k8s_watch::watch(self.client.clone(), kind, namespace, selector)
    }
}
