//! The workload reconciler: one `Application` per managed application.
use futures_util::stream::BoxStream;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec, Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::ByteString;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info_span, warn, Instrument, Span};

use crate::batch::Batch;
use crate::error::{Error, Result, ResultExt};
use crate::k8s::{ClusterClient, Object, ObjectRef, ResourceKind, WatchSelector};
use crate::models::{AppIdentity, ApplicationConfig, ApplicationState, DeploymentState, DeploymentTopology, ServicePort as PortSpec, ServiceParam, Unit};
use crate::naming::{self, Labels};
use crate::podspec::build_pod_spec;
use crate::services;
use crate::status::{random_prefix, ClaimFilesystemInfo, Clock, DefaultPodStatus, FilesystemInfoSource, PodStatusSource, SystemClock};
use crate::storage::{configure_storage, ClaimTemplateStorage, PodStorage, StandaloneClaimStorage};
use crate::telemetry;

pub type PrefixGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Reuse the live prefix when there is one, otherwise mint a new one.
pub fn storage_unique_prefix(existing: Option<String>, generate: impl FnOnce() -> String) -> String {
    existing.filter(|p| !p.is_empty()).unwrap_or_else(generate)
}

/// Turn `NotFound` into `None`.
pub(crate) fn optional<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// The live primary workload.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Workload {
    StatefulSet(StatefulSet),
    Deployment(Deployment),
    DaemonSet(DaemonSet),
}

impl Workload {
    pub(crate) fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        match self {
            Workload::StatefulSet(o) => o.spec.as_mut()?.template.spec.as_mut(),
            Workload::Deployment(o) => o.spec.as_mut()?.template.spec.as_mut(),
            Workload::DaemonSet(o) => o.spec.as_mut()?.template.spec.as_mut(),
        }
    }

    pub(crate) fn into_object(self) -> Object {
        match self {
            Workload::StatefulSet(o) => Object::StatefulSet(o),
            Workload::Deployment(o) => Object::Deployment(o),
            Workload::DaemonSet(o) => Object::DaemonSet(o),
        }
    }
}

struct ExistenceCheck {
    label: &'static str,
    kind: ResourceKind,
    name: String,
}

/// Reconciles one application into the cluster.
///
/// Callers must not run two mutating operations on the same application
/// concurrently.
#[derive(Clone)]
pub struct Application {
    pub(crate) identity: AppIdentity,
    pub(crate) cluster: Arc<dyn ClusterClient>,
    pub(crate) pod_status: Arc<dyn PodStatusSource>,
    pub(crate) filesystems: Arc<dyn FilesystemInfoSource>,
    pub(crate) clock: Arc<dyn Clock>,
    random_prefix: PrefixGenerator,
    span: Span,
}

impl Application {
    pub fn new(identity: AppIdentity, cluster: Arc<dyn ClusterClient>) -> Self {
        let span = info_span!("application", app = %identity.name, namespace = %identity.namespace, topology = %identity.topology);
        Self {
            filesystems: Arc::new(ClaimFilesystemInfo::new(cluster.clone())),
            pod_status: Arc::new(DefaultPodStatus),
            clock: Arc::new(SystemClock),
            random_prefix: Arc::new(random_prefix),
            identity,
            cluster,
            span,
        }
    }

    pub fn with_pod_status(mut self, source: Arc<dyn PodStatusSource>) -> Self {
        self.pod_status = source;
        self
    }

    pub fn with_filesystem_info(mut self, source: Arc<dyn FilesystemInfoSource>) -> Self {
        self.filesystems = source;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_prefix_generator(mut self, generate: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.random_prefix = Arc::new(generate);
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn identity(&self) -> &AppIdentity { &self.identity }
    pub fn name(&self) -> &str { &self.identity.name }
    pub fn namespace(&self) -> &str { &self.identity.namespace }

    /// Create or update every object the application needs, in one batch.
    pub async fn ensure(&self, config: &ApplicationConfig) -> Result<()> { self.observed("ensure", self.ensure_inner(config)).await }

    pub async fn exists(&self) -> Result<DeploymentState> { self.observed("exists", self.exists_inner()).await }

    /// Remove workload, services and secret. Storage is left alone.
    pub async fn delete(&self) -> Result<()> { self.observed("delete", self.delete_inner()).await }

    pub async fn state(&self) -> Result<ApplicationState> { self.observed("state", services::state::state(self)).await }

    pub async fn units(&self) -> Result<Vec<Unit>> { self.observed("units", services::state::units(self)).await }

    pub async fn update_ports(&self, ports: &[PortSpec], update_container_ports: bool) -> Result<()> {
        self.observed("update_ports", services::ports::update_ports(self, ports, update_container_ports)).await
    }

    pub async fn update_service(&self, param: &ServiceParam) -> Result<()> {
        self.observed("update_service", services::ports::update_service(self, param)).await
    }

    /// Notifies on every change to the primary workload.
    pub fn watch(&self) -> Result<BoxStream<'static, Result<()>>> {
        let _enter = self.span.enter();
        let kind = self.workload_kind()?;
        let selector = naming::field_selector(self.name(), self.namespace());
        self.cluster.watch(kind, self.namespace(), WatchSelector::Fields(selector))
    }

    /// Notifies on every change to the application's pods.
    pub fn watch_replicas(&self) -> Result<BoxStream<'static, Result<()>>> {
        let _enter = self.span.enter();
        self.workload_kind()?;
        self.cluster.watch(ResourceKind::Pod, self.namespace(), WatchSelector::Labels(self.label_selector()))
    }

    async fn observed<T>(&self, operation: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let result = fut.instrument(self.span.clone()).await;
        telemetry::observe(operation, &result);
        if let Err(e) = &result {
            warn!(parent: &self.span, operation, error = %e, "operation.failed");
        }
        result
    }

    pub(crate) fn unsupported(&self) -> Error {
        Error::not_supported(format!("deployment type {:?}", self.identity.topology.as_str()))
    }

    fn workload_kind(&self) -> Result<ResourceKind> {
        match self.identity.topology {
            DeploymentTopology::Stateful => Ok(ResourceKind::StatefulSet),
            DeploymentTopology::Stateless => Ok(ResourceKind::Deployment),
            DeploymentTopology::Daemon => Ok(ResourceKind::DaemonSet),
            DeploymentTopology::Unrecognized(_) => Err(self.unsupported()),
        }
    }

    pub(crate) async fn get_workload(&self) -> Result<Workload> {
        let (ns, name) = (self.namespace(), self.name());
        match self.identity.topology {
            DeploymentTopology::Stateful => self.cluster.get_stateful_set(ns, name).await.map(Workload::StatefulSet),
            DeploymentTopology::Stateless => self.cluster.get_deployment(ns, name).await.map(Workload::Deployment),
            DeploymentTopology::Daemon => self.cluster.get_daemon_set(ns, name).await.map(Workload::DaemonSet),
            DeploymentTopology::Unrecognized(_) => Err(self.unsupported()),
        }
    }

    pub(crate) fn labels(&self) -> Labels { naming::labels_for_app(self.name(), self.identity.legacy_labels) }

    pub(crate) fn selector_labels(&self) -> Labels { naming::selector_labels_for_app(self.name(), self.identity.legacy_labels) }

    pub(crate) fn label_selector(&self) -> String { naming::to_selector(&self.selector_labels()) }

    fn annotations(&self, config: &ApplicationConfig) -> Labels {
        let legacy = self.identity.legacy_labels;
        let mut annotations = naming::resource_tags_to_annotations(&config.resource_tags, legacy);
        annotations.extend(naming::annotations_for_version(&config.agent_version, legacy));
        annotations
    }

    fn meta(&self, name: &str, annotations: Labels) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace().to_string()),
            labels: Some(self.labels()),
            annotations: Some(annotations),
            ..Default::default()
        }
    }

    fn resolve_prefix(&self, live: Option<&ObjectMeta>) -> String {
        let existing = naming::storage_prefix_from_annotations(live.and_then(|m| m.annotations.as_ref()));
        let reused = existing.is_some();
        let prefix = storage_unique_prefix(existing, || (self.random_prefix)());
        debug!(prefix = %prefix, reused, "storage.prefix");
        prefix
    }

    fn workload_meta(&self, annotations: &Labels, prefix: &str) -> ObjectMeta {
        let mut annotations = annotations.clone();
        annotations.insert(naming::ANNOTATION_STORAGE_PREFIX.to_string(), prefix.to_string());
        self.meta(self.name(), annotations)
    }

    fn template(&self, pod: PodSpec, annotations: &Labels) -> PodTemplateSpec {
        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(self.selector_labels()),
                annotations: Some(annotations.clone()),
                ..Default::default()
            }),
            spec: Some(pod),
        }
    }

    fn selector(&self) -> LabelSelector { LabelSelector { match_labels: Some(self.selector_labels()), ..Default::default() } }

    fn secret(&self, config: &ApplicationConfig) -> Secret {
        let data = [
            ("JUJU_K8S_APPLICATION", self.name()),
            ("JUJU_K8S_MODEL", self.identity.model_uuid.as_str()),
            ("JUJU_K8S_APPLICATION_PASSWORD", config.introduction_secret.as_str()),
            ("JUJU_K8S_CONTROLLER_ADDRESSES", config.controller_addresses.as_str()),
            ("JUJU_K8S_CONTROLLER_CA_CERT", config.controller_cert_bundle.as_str()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
        .collect::<BTreeMap<_, _>>();
        Secret { metadata: self.meta(&naming::secret_name(self.name()), self.annotations(config)), data: Some(data), ..Default::default() }
    }

    /// The default service is only created once; later port changes go
    /// through `update_ports`.
    async fn stage_default_service(&self, batch: &mut Batch<'_>, annotations: &Labels) -> Result<()> {
        if optional(self.cluster.get_service(self.namespace(), self.name()).await)?.is_some() {
            return Ok(());
        }
        debug!("service.default.create");
        batch.stage(Object::Service(Service {
            metadata: self.meta(self.name(), annotations.clone()),
            spec: Some(ServiceSpec {
                selector: Some(self.selector_labels()),
                type_: Some("ClusterIP".into()),
                ports: Some(vec![ServicePort { name: Some("placeholder".into()), port: 65535, ..Default::default() }]),
                ..Default::default()
            }),
            ..Default::default()
        }));
        Ok(())
    }

    fn headless_service(&self, annotations: &Labels) -> Service {
        let mut annotations = annotations.clone();
        annotations.insert(naming::TOLERATE_UNREADY_ANNOTATION.to_string(), "true".to_string());
        Service {
            metadata: self.meta(&naming::headless_service_name(self.name()), annotations),
            spec: Some(ServiceSpec {
                selector: Some(self.selector_labels()),
                type_: Some("ClusterIP".into()),
                cluster_ip: Some("None".into()),
                publish_not_ready_addresses: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn ensure_inner(&self, config: &ApplicationConfig) -> Result<()> {
        self.workload_kind()?;
        config.validate(self.name())?;
        debug!(filesystems = config.filesystems.len(), containers = config.containers.len(), "ensure.start");

        let (ns, name) = (self.namespace(), self.name());
        let annotations = self.annotations(config);
        let mut batch = Batch::new(self.cluster.as_ref());
        batch.stage(Object::Secret(self.secret(config)));
        self.stage_default_service(&mut batch, &annotations)
            .await
            .with_context(|| format!("ensuring the default service {name:?}"))?;

        let mut pod = build_pod_spec(name, config).context("generating application podspec")?;
        let classes = self.cluster.list_storage_classes().await.context("listing storage classes")?;

        match &self.identity.topology {
            DeploymentTopology::Stateful => {
                batch.stage(Object::Service(self.headless_service(&annotations)));
                let live = optional(self.cluster.get_stateful_set(ns, name).await)?;
                let prefix = self.resolve_prefix(live.as_ref().map(|o| &o.metadata));
                let mut templates = Vec::new();
                let mut handler = ClaimTemplateStorage::new(PodStorage::new(&mut pod, &config.containers), &mut templates, &mut batch);
                configure_storage(&self.identity, &prefix, &config.filesystems, &classes, &mut handler)?;
                let workload = StatefulSet {
                    metadata: self.workload_meta(&annotations, &prefix),
                    spec: Some(StatefulSetSpec {
                        replicas: live.is_none().then_some(1),
                        selector: self.selector(),
                        template: self.template(pod, &annotations),
                        pod_management_policy: Some("Parallel".into()),
                        volume_claim_templates: (!templates.is_empty()).then_some(templates),
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                batch.stage(Object::StatefulSet(workload));
            }
            DeploymentTopology::Stateless => {
                let live = optional(self.cluster.get_deployment(ns, name).await)?;
                let prefix = self.resolve_prefix(live.as_ref().map(|o| &o.metadata));
                let mut handler = StandaloneClaimStorage::new(PodStorage::new(&mut pod, &config.containers), ns, &mut batch);
                configure_storage(&self.identity, &prefix, &config.filesystems, &classes, &mut handler)?;
                let workload = Deployment {
                    metadata: self.workload_meta(&annotations, &prefix),
                    spec: Some(DeploymentSpec {
                        replicas: live.is_none().then_some(1),
                        selector: self.selector(),
                        template: self.template(pod, &annotations),
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                batch.stage(Object::Deployment(workload));
            }
            DeploymentTopology::Daemon => {
                let live = optional(self.cluster.get_daemon_set(ns, name).await)?;
                let prefix = self.resolve_prefix(live.as_ref().map(|o| &o.metadata));
                let mut handler = StandaloneClaimStorage::new(PodStorage::new(&mut pod, &config.containers), ns, &mut batch);
                configure_storage(&self.identity, &prefix, &config.filesystems, &classes, &mut handler)?;
                let workload = DaemonSet {
                    metadata: self.workload_meta(&annotations, &prefix),
                    spec: Some(DaemonSetSpec {
                        selector: self.selector(),
                        template: self.template(pod, &annotations),
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                batch.stage(Object::DaemonSet(workload));
            }
            DeploymentTopology::Unrecognized(_) => return Err(self.unsupported()),
        }
        debug!(changes = batch.changes().len(), "ensure.apply");
        batch.run(false).await
    }

    async fn exists_inner(&self) -> Result<DeploymentState> {
        let label = match self.workload_kind()? {
            ResourceKind::StatefulSet => "statefulset",
            ResourceKind::Deployment => "deployment",
            _ => "daemonset",
        };
        let checks = [
            ExistenceCheck { label, kind: self.workload_kind()?, name: self.name().to_string() },
            ExistenceCheck { label: "secret", kind: ResourceKind::Secret, name: naming::secret_name(self.name()) },
            ExistenceCheck { label: "service", kind: ResourceKind::Service, name: self.name().to_string() },
        ];
        let mut state = DeploymentState::default();
        for check in checks {
            let meta = self.live_meta(check.kind, &check.name).await.with_context(|| format!("{} resource check", check.label))?;
            let Some(meta) = meta else { continue };
            state.exists = true;
            if meta.deletion_timestamp.is_some() {
                debug!(resource = check.label, "exists.terminating");
                return Ok(DeploymentState { exists: true, terminating: true });
            }
        }
        Ok(state)
    }

    async fn live_meta(&self, kind: ResourceKind, name: &str) -> Result<Option<ObjectMeta>> {
        let ns = self.namespace();
        let meta = match kind {
            ResourceKind::StatefulSet => optional(self.cluster.get_stateful_set(ns, name).await)?.map(|o| o.metadata),
            ResourceKind::Deployment => optional(self.cluster.get_deployment(ns, name).await)?.map(|o| o.metadata),
            ResourceKind::DaemonSet => optional(self.cluster.get_daemon_set(ns, name).await)?.map(|o| o.metadata),
            ResourceKind::Secret => optional(self.cluster.get_secret(ns, name).await)?.map(|o| o.metadata),
            ResourceKind::Service => optional(self.cluster.get_service(ns, name).await)?.map(|o| o.metadata),
            other => return Err(Error::not_supported(format!("existence check for {other}"))),
        };
        Ok(meta)
    }

    async fn delete_inner(&self) -> Result<()> {
        let (ns, name) = (self.namespace(), self.name());
        let kind = self.workload_kind()?;
        debug!("delete.start");
        let mut batch = Batch::new(self.cluster.as_ref());
        batch.stage_delete(ObjectRef::namespaced(kind, ns, name));
        if kind == ResourceKind::StatefulSet {
            batch.stage_delete(ObjectRef::namespaced(ResourceKind::Service, ns, &naming::headless_service_name(name)));
        }
        batch.stage_delete(ObjectRef::namespaced(ResourceKind::Service, ns, name));
        batch.stage_delete(ObjectRef::namespaced(ResourceKind::Secret, ns, &naming::secret_name(name)));
        batch.run(false).await
    }
}
