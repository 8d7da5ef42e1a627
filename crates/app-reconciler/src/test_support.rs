//! In-memory cluster and collaborator doubles for unit and integration tests.
//!
//! `FakeCluster` keeps typed objects in maps, applies the defaulting the
//! engine relies on (replicas default to 1 and survive updates that omit
//! them), paginates pod listings and records every mutation in a log.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret, Service, Volume, VolumeMount};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::k8s::{ClusterClient, Object, ObjectRef, PodListParams, PodPage, ResourceKind, WatchSelector};
use crate::models::{FilesystemInfo, StatusInfo};
use crate::naming;
use crate::status::{Clock, FilesystemInfoSource, PodStatusSource};

type Key = (ResourceKind, String, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Object>,
    pods: BTreeMap<String, Vec<Pod>>,
    page_size: Option<usize>,
    failing_upserts: BTreeSet<String>,
    failing_gets: BTreeSet<(ResourceKind, String)>,
    log: Vec<String>,
    list_calls: usize,
}

#[derive(Clone, Default)]
pub struct FakeCluster {
    inner: Arc<Mutex<Inner>>,
}

fn key_of(r: &ObjectRef) -> Key { (r.kind, r.namespace.clone().unwrap_or_default(), r.name.clone()) }

impl FakeCluster {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(|p| p.into_inner()) }

    /// Split pod listings into pages of `size`.
    pub fn with_page_size(self, size: usize) -> Self {
        self.lock().page_size = Some(size);
        self
    }

    /// Store an object verbatim, bypassing defaulting and the log.
    pub fn insert(&self, object: Object) {
        let key = key_of(&object.to_ref());
        self.lock().objects.insert(key, object);
    }

    pub fn add_pod(&self, namespace: &str, pod: Pod) { self.lock().pods.entry(namespace.to_string()).or_default().push(pod); }

    /// Give an object a deletion timestamp, as if a delete were in flight.
    pub fn mark_deleting(&self, kind: ResourceKind, namespace: &str, name: &str) {
        let ns = if kind == ResourceKind::StorageClass { String::new() } else { namespace.to_string() };
        let mut inner = self.lock();
        if let Some(object) = inner.objects.get_mut(&(kind, ns, name.to_string())) {
            meta_mut(object).deletion_timestamp = Some(Time(Utc::now()));
        }
    }

    pub fn fail_upserts_of(&self, name: &str) { self.lock().failing_upserts.insert(name.to_string()); }

    pub fn fail_gets_of(&self, kind: ResourceKind, name: &str) { self.lock().failing_gets.insert((kind, name.to_string())); }

    pub fn log(&self) -> Vec<String> { self.lock().log.clone() }

    pub fn clear_log(&self) { self.lock().log.clear() }

    /// Number of pod list requests served.
    pub fn list_calls(&self) -> usize { self.lock().list_calls }

    pub fn object(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<Object> {
        let ns = if kind == ResourceKind::StorageClass { String::new() } else { namespace.to_string() };
        self.lock().objects.get(&(kind, ns, name.to_string())).cloned()
    }

    pub fn count(&self, kind: ResourceKind) -> usize { self.lock().objects.keys().filter(|(k, _, _)| *k == kind).count() }

    fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Object> {
        if self.lock().failing_gets.contains(&(kind, name.to_string())) {
            return Err(Error::invariant(format!("injected failure reading {kind} {name:?}")));
        }
        self.object(kind, namespace, name).ok_or_else(|| Error::not_found(format!("{} {:?}", kind.to_string().to_lowercase(), name)))
    }
}

fn meta_mut(object: &mut Object) -> &mut k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
    match object {
        Object::Secret(o) => &mut o.metadata,
        Object::Service(o) => &mut o.metadata,
        Object::StatefulSet(o) => &mut o.metadata,
        Object::Deployment(o) => &mut o.metadata,
        Object::DaemonSet(o) => &mut o.metadata,
        Object::PersistentVolumeClaim(o) => &mut o.metadata,
        Object::StorageClass(o) => &mut o.metadata,
    }
}

/// Server-side defaulting for replica counts.
fn default_replicas(mut object: Object, existing: Option<&Object>) -> Object {
    match (&mut object, existing) {
        (Object::StatefulSet(new), old) => {
            let old = match old { Some(Object::StatefulSet(o)) => o.spec.as_ref().and_then(|s| s.replicas), _ => None };
            if let Some(spec) = new.spec.as_mut() {
                spec.replicas = spec.replicas.or(old).or(Some(1));
            }
        }
        (Object::Deployment(new), old) => {
            let old = match old { Some(Object::Deployment(o)) => o.spec.as_ref().and_then(|s| s.replicas), _ => None };
            if let Some(spec) = new.spec.as_mut() {
                spec.replicas = spec.replicas.or(old).or(Some(1));
            }
        }
        _ => {}
    }
    object
}

macro_rules! typed_get {
    ($self:ident, $kind:ident, $ns:expr, $name:expr) => {
        match $self.get(ResourceKind::$kind, $ns, $name)? {
            Object::$kind(o) => Ok(o),
            other => Err(Error::invariant(format!("stored {} under {}", other.kind(), ResourceKind::$kind))),
        }
    };
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> { typed_get!(self, Secret, namespace, name) }
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> { typed_get!(self, Service, namespace, name) }
    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<StatefulSet> { typed_get!(self, StatefulSet, namespace, name) }
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> { typed_get!(self, Deployment, namespace, name) }
    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<DaemonSet> { typed_get!(self, DaemonSet, namespace, name) }
    async fn get_persistent_volume_claim(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim> {
        typed_get!(self, PersistentVolumeClaim, namespace, name)
    }

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        Ok(self.lock().objects.values().filter_map(|o| match o { Object::StorageClass(sc) => Some(sc.clone()), _ => None }).collect())
    }

    async fn list_pods(&self, namespace: &str, params: &PodListParams) -> Result<PodPage> {
        let mut inner = self.lock();
        inner.list_calls += 1;
        let selector: Vec<(&str, &str)> = params.label_selector.split(',').filter_map(|kv| kv.split_once('=')).collect();
        let matching: Vec<Pod> = inner
            .pods
            .get(namespace)
            .into_iter()
            .flatten()
            .filter(|p| {
                let labels = p.metadata.labels.clone().unwrap_or_default();
                selector.iter().all(|(k, v)| labels.get(*k).map(String::as_str) == Some(*v))
            })
            .cloned()
            .collect();
        let Some(size) = inner.page_size else {
            return Ok(PodPage { items: matching, continue_token: None, remaining_item_count: None });
        };
        let start: usize = match params.continue_token.as_deref() {
            Some(token) => token.parse().map_err(|_| Error::not_valid(format!("continue token {token:?}")))?,
            None => 0,
        };
        let end = (start + size).min(matching.len());
        let remaining = matching.len().saturating_sub(end);
        Ok(PodPage {
            items: matching.get(start..end).map(<[Pod]>::to_vec).unwrap_or_default(),
            continue_token: (remaining > 0).then(|| end.to_string()),
            remaining_item_count: Some(remaining as i64),
        })
    }

    async fn upsert(&self, object: &Object, dry_run: bool) -> Result<()> {
        let target = object.to_ref();
        let mut inner = self.lock();
        if inner.failing_upserts.contains(&target.name) {
            return Err(Error::invariant(format!("injected failure applying {target}")));
        }
        if dry_run {
            return Ok(());
        }
        let key = key_of(&target);
        let stored = default_replicas(object.clone(), inner.objects.get(&key));
        inner.objects.insert(key, stored);
        inner.log.push(format!("apply {target}"));
        Ok(())
    }

    async fn remove(&self, target: &ObjectRef, dry_run: bool) -> Result<()> {
        let mut inner = self.lock();
        let key = key_of(target);
        if !inner.objects.contains_key(&key) {
            return Err(Error::not_found(format!("{} {:?}", target.kind.to_string().to_lowercase(), target.name)));
        }
        if !dry_run {
            inner.objects.remove(&key);
            inner.log.push(format!("delete {target}"));
        }
        Ok(())
    }

    fn watch(&self, kind: ResourceKind, namespace: &str, selector: WatchSelector) -> Result<BoxStream<'static, Result<()>>> {
        self.lock().log.push(format!("watch {kind} {namespace} {selector:?}"));
        Ok(stream::iter(vec![Ok(())]).boxed())
    }
}

/// A bare pod carrying `labels`.
pub fn pod(name: &str, labels: &naming::Labels) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.name = Some(name.to_string());
    pod.metadata.labels = Some(labels.clone());
    pod
}

#[derive(Debug, Clone)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> { self.0 }
}

/// Reports the same status for every pod.
#[derive(Debug, Clone)]
pub struct StaticPodStatus(pub String);

#[async_trait]
impl PodStatusSource for StaticPodStatus {
    async fn pod_status(&self, _pod: &Pod, now: DateTime<Utc>) -> Result<StatusInfo> {
        Ok(StatusInfo { status: self.0.clone(), message: String::new(), since: now })
    }
}

/// Filesystem info keyed by volume name; unknown volumes yield `None`.
#[derive(Debug, Clone, Default)]
pub struct StaticFilesystemInfo(pub BTreeMap<String, FilesystemInfo>);

#[async_trait]
impl FilesystemInfoSource for StaticFilesystemInfo {
    async fn filesystem_info(
        &self,
        _namespace: &str,
        _pod: &Pod,
        volume: &Volume,
        mount: &VolumeMount,
        _now: DateTime<Utc>,
    ) -> Result<Option<FilesystemInfo>> {
        Ok(self.0.get(&volume.name).cloned().map(|mut info| {
            info.mount_point = mount.mount_path.clone();
            info
        }))
    }
}
