//! Filesystem resolution and the per-topology storage strategies.
use k8s_openapi::api::core::v1::{
    EmptyDirVolumeSource, PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec,
    Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::batch::Batch;
use crate::error::{Error, Result, ResultExt};
use crate::k8s::Object;
use crate::models::{AppIdentity, ContainerConfig, FilesystemSpec, KUBERNETES_PROVIDER};
use crate::naming;
use crate::podspec::{DATA_DIR, SUPERVISOR_CONTAINER};

pub const ATTR_STORAGE_MEDIUM: &str = "storage-medium";
pub const ATTR_STORAGE_CLASS: &str = "storage-class";
pub const ATTR_STORAGE_PROVISIONER: &str = "storage-provisioner";
pub const ATTR_STORAGE_MODE: &str = "storage-mode";
pub const ATTR_RECLAIM_POLICY: &str = "storage-reclaim-policy";
pub const ATTR_PARAMETER_PREFIX: &str = "parameters.";

const ACCESS_MODES: &[&str] = &["ReadWriteOnce", "ReadOnlyMany", "ReadWriteMany"];
const RECLAIM_POLICIES: &[&str] = &["Delete", "Retain", "Recycle"];

/// What one declared filesystem resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum VolumeBinding {
    /// Pod-local volume; nothing outlives the pod.
    Volume(Volume),
    /// A claim, plus the class to create first when no usable class exists.
    Claim { claim: PersistentVolumeClaim, storage_class: Option<StorageClass> },
}

/// Where a topology puts resolved storage.
pub trait StorageHandler {
    fn handle_volume(&mut self, volume: Volume, mount_path: &str, read_only: bool) -> Result<VolumeMount>;
    fn handle_claim(&mut self, claim: PersistentVolumeClaim, mount_path: &str, read_only: bool) -> Result<VolumeMount>;
    fn handle_storage_class(&mut self, class: StorageClass) -> Result<()>;
    fn handle_mount(&mut self, storage_name: &str, mount: VolumeMount) -> Result<()>;
}

/// Default mount path unless the attachment names one.
pub fn mount_path(index: usize, app: &str, fs: &FilesystemSpec) -> String {
    match fs.attachment.as_ref().and_then(|a| a.path.as_deref()).filter(|p| !p.is_empty()) {
        Some(path) => path.to_string(),
        None => format!("{DATA_DIR}/storage/fs/{app}/{}/{index}", fs.storage_name),
    }
}

/// Resolve every filesystem, in declaration order, through `handler`.
pub fn configure_storage(
    app: &AppIdentity,
    prefix: &str,
    filesystems: &[FilesystemSpec],
    existing_classes: &[StorageClass],
    handler: &mut dyn StorageHandler,
) -> Result<()> {
    let mut classes: BTreeMap<String, StorageClass> = existing_classes
        .iter()
        .filter_map(|sc| Some((sc.metadata.name.clone()?, sc.clone())))
        .collect();
    let mut seen = BTreeSet::new();
    for (index, fs) in filesystems.iter().enumerate() {
        if !seen.insert(fs.storage_name.as_str()) {
            return Err(Error::not_valid(format!("duplicated storage name {:?} for {:?}", fs.storage_name, app.name)));
        }
        let path = mount_path(index, &app.name, fs);
        let read_only = fs.read_only();
        debug!(app = %app.name, storage = %fs.storage_name, mount_path = %path, "storage.filesystem");
        let mount = match filesystem_to_volume_info(app, fs, prefix, &classes)? {
            VolumeBinding::Volume(volume) => handler.handle_volume(volume, &path, read_only)?,
            VolumeBinding::Claim { claim, storage_class } => {
                if let Some(class) = storage_class {
                    let name = class.metadata.name.clone().unwrap_or_default();
                    debug!(app = %app.name, storage = %fs.storage_name, class = %name, "storage.class.new");
                    handler.handle_storage_class(class.clone())?;
                    classes.insert(name, class);
                }
                handler.handle_claim(claim, &path, read_only)?
            }
        };
        handler.handle_mount(&fs.storage_name, mount)?;
    }
    Ok(())
}

/// Turn one filesystem into a volume or a claim (and maybe a new class).
///
/// Class precedence: an existing class with the requested name, then the
/// namespace-qualified name, then a new namespace-qualified class.
pub fn filesystem_to_volume_info(
    app: &AppIdentity,
    fs: &FilesystemSpec,
    prefix: &str,
    classes: &BTreeMap<String, StorageClass>,
) -> Result<VolumeBinding> {
    if fs.provider != KUBERNETES_PROVIDER {
        return Err(Error::not_valid(format!("storage provider {:?} for {:?}", fs.provider, fs.storage_name)));
    }
    let size = Quantity(format!("{}Mi", fs.size));
    let volume_name = naming::volume_name(&app.name, &fs.storage_name);

    if let Some(medium) = fs.attributes.get(ATTR_STORAGE_MEDIUM).filter(|m| matches!(m.as_str(), "Memory" | "HugePages")) {
        return Ok(VolumeBinding::Volume(Volume {
            name: volume_name,
            empty_dir: Some(EmptyDirVolumeSource { medium: Some(medium.clone()), size_limit: Some(size) }),
            ..Default::default()
        }));
    }

    let params = ClaimParams::parse(&fs.attributes).with_context(|| format!("getting volume params for {}", fs.storage_name))?;
    let (class_name, new_class) = match params.storage_class.as_deref() {
        None => (None, None),
        Some(requested) if classes.contains_key(requested) => (Some(requested.to_string()), None),
        Some(requested) => {
            let qualified = naming::qualified_storage_class_name(&app.namespace, requested);
            if classes.contains_key(&qualified) {
                (Some(qualified), None)
            } else {
                let class = params.new_storage_class(app, &qualified)?;
                (Some(qualified), Some(class))
            }
        }
    };

    let mut labels = naming::labels_for_storage(&fs.storage_name, app.legacy_labels);
    labels.extend(naming::labels_managed_by());
    let mut annotations = naming::resource_tags_to_annotations(&fs.resource_tags, app.legacy_labels);
    annotations.extend(naming::annotations_for_storage(&fs.storage_name, app.legacy_labels));

    let claim = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(naming::claim_name(&volume_name, prefix)),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            storage_class_name: class_name,
            access_modes: Some(vec![params.access_mode.clone()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), size)])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    Ok(VolumeBinding::Claim { claim, storage_class: new_class })
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ClaimParams {
    storage_class: Option<String>,
    provisioner: Option<String>,
    access_mode: String,
    reclaim_policy: Option<String>,
    parameters: BTreeMap<String, String>,
}

impl ClaimParams {
    fn parse(attrs: &BTreeMap<String, String>) -> Result<Self> {
        let non_empty = |key: &str| attrs.get(key).filter(|v| !v.is_empty()).cloned();
        let access_mode = non_empty(ATTR_STORAGE_MODE).unwrap_or_else(|| ACCESS_MODES[0].to_string());
        if !ACCESS_MODES.contains(&access_mode.as_str()) {
            return Err(Error::not_valid(format!("storage mode {access_mode:?}")));
        }
        let reclaim_policy = non_empty(ATTR_RECLAIM_POLICY);
        if let Some(policy) = reclaim_policy.as_deref().filter(|p| !RECLAIM_POLICIES.contains(p)) {
            return Err(Error::not_valid(format!("reclaim policy {policy:?}")));
        }
        let params = Self {
            storage_class: non_empty(ATTR_STORAGE_CLASS),
            provisioner: non_empty(ATTR_STORAGE_PROVISIONER),
            access_mode,
            reclaim_policy,
            parameters: attrs
                .iter()
                .filter_map(|(k, v)| Some((k.strip_prefix(ATTR_PARAMETER_PREFIX)?.to_string(), v.clone())))
                .collect(),
        };
        if params.storage_class.is_none() && params.provisioner.is_some() {
            return Err(Error::not_valid("storage-provisioner without storage-class"));
        }
        Ok(params)
    }

    fn new_storage_class(&self, app: &AppIdentity, name: &str) -> Result<StorageClass> {
        let provisioner = self
            .provisioner
            .clone()
            .ok_or_else(|| Error::not_valid(format!("missing storage-provisioner for new storage class {name:?}")))?;
        Ok(StorageClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(naming::labels_for_model(&app.model_name, app.legacy_labels)),
                ..Default::default()
            },
            provisioner,
            parameters: (!self.parameters.is_empty()).then(|| self.parameters.clone()),
            reclaim_policy: self.reclaim_policy.clone(),
            ..Default::default()
        })
    }
}

/// Add `volume` to the pod unless an identical one is already there.
pub fn push_unique_volume(pod: &mut PodSpec, volume: Volume) -> Result<()> {
    let volumes = pod.volumes.get_or_insert_with(Vec::new);
    match volumes.iter().find(|v| v.name == volume.name) {
        Some(existing) if *existing == volume => Ok(()),
        Some(_) => Err(Error::not_valid(format!("duplicated volume {:?}", volume.name))),
        None => {
            volumes.push(volume);
            Ok(())
        }
    }
}

pub fn push_unique_claim_template(templates: &mut Vec<PersistentVolumeClaim>, claim: PersistentVolumeClaim) -> Result<()> {
    match templates.iter().find(|t| t.metadata.name == claim.metadata.name) {
        Some(existing) if *existing == claim => Ok(()),
        Some(_) => Err(Error::not_valid(format!("duplicated volume claim template {:?}", claim.metadata.name.unwrap_or_default()))),
        None => {
            templates.push(claim);
            Ok(())
        }
    }
}

/// Pod-side half shared by both strategies.
pub struct PodStorage<'a> {
    pod: &'a mut PodSpec,
    containers: &'a BTreeMap<String, ContainerConfig>,
}

impl<'a> PodStorage<'a> {
    pub fn new(pod: &'a mut PodSpec, containers: &'a BTreeMap<String, ContainerConfig>) -> Self { Self { pod, containers } }

    fn add_volume(&mut self, volume: Volume, mount_path: &str, read_only: bool) -> Result<VolumeMount> {
        let mount = volume_mount(&volume.name, mount_path, read_only);
        push_unique_volume(self.pod, volume)?;
        Ok(mount)
    }

    /// The supervisor always gets the mount; sidecars get it at their own
    /// declared path when they ask for the storage.
    fn attach(&mut self, storage_name: &str, mount: VolumeMount) {
        for container in &mut self.pod.containers {
            if container.name == SUPERVISOR_CONTAINER {
                container.volume_mounts.get_or_insert_with(Vec::new).push(mount.clone());
                continue;
            }
            let Some(config) = self.containers.get(&container.name) else { continue };
            for declared in config.mounts.iter().filter(|m| m.storage_name == storage_name) {
                let mut copy = mount.clone();
                copy.mount_path = declared.path.clone();
                container.volume_mounts.get_or_insert_with(Vec::new).push(copy);
            }
        }
    }
}

fn volume_mount(name: &str, mount_path: &str, read_only: bool) -> VolumeMount {
    VolumeMount { name: name.into(), mount_path: mount_path.into(), read_only: read_only.then_some(true), ..Default::default() }
}

/// Stateful: claims become claim templates on the StatefulSet.
pub struct ClaimTemplateStorage<'a, 'b> {
    pod: PodStorage<'a>,
    templates: &'a mut Vec<PersistentVolumeClaim>,
    batch: &'a mut Batch<'b>,
}

impl<'a, 'b> ClaimTemplateStorage<'a, 'b> {
    pub fn new(pod: PodStorage<'a>, templates: &'a mut Vec<PersistentVolumeClaim>, batch: &'a mut Batch<'b>) -> Self {
        Self { pod, templates, batch }
    }
}

impl StorageHandler for ClaimTemplateStorage<'_, '_> {
    fn handle_volume(&mut self, volume: Volume, mount_path: &str, read_only: bool) -> Result<VolumeMount> {
        self.pod.add_volume(volume, mount_path, read_only)
    }

    fn handle_claim(&mut self, claim: PersistentVolumeClaim, mount_path: &str, read_only: bool) -> Result<VolumeMount> {
        let name = claim.metadata.name.clone().unwrap_or_default();
        push_unique_claim_template(self.templates, claim)?;
        Ok(volume_mount(&name, mount_path, read_only))
    }

    fn handle_storage_class(&mut self, class: StorageClass) -> Result<()> {
        self.batch.stage(Object::StorageClass(class));
        Ok(())
    }

    fn handle_mount(&mut self, storage_name: &str, mount: VolumeMount) -> Result<()> {
        self.pod.attach(storage_name, mount);
        Ok(())
    }
}

/// Stateless and Daemon: claims are standalone objects mounted as volumes.
pub struct StandaloneClaimStorage<'a, 'b> {
    pod: PodStorage<'a>,
    namespace: &'a str,
    batch: &'a mut Batch<'b>,
}

impl<'a, 'b> StandaloneClaimStorage<'a, 'b> {
    pub fn new(pod: PodStorage<'a>, namespace: &'a str, batch: &'a mut Batch<'b>) -> Self { Self { pod, namespace, batch } }
}

impl StorageHandler for StandaloneClaimStorage<'_, '_> {
    fn handle_volume(&mut self, volume: Volume, mount_path: &str, read_only: bool) -> Result<VolumeMount> {
        self.pod.add_volume(volume, mount_path, read_only)
    }

    fn handle_claim(&mut self, mut claim: PersistentVolumeClaim, mount_path: &str, read_only: bool) -> Result<VolumeMount> {
        let name = claim.metadata.name.clone().unwrap_or_default();
        claim.metadata.namespace = Some(self.namespace.to_string());
        self.batch.stage(Object::PersistentVolumeClaim(claim));
        let volume = Volume {
            name: name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource { claim_name: name, read_only: read_only.then_some(true) }),
            ..Default::default()
        };
        self.pod.add_volume(volume, mount_path, read_only)
    }

    fn handle_storage_class(&mut self, class: StorageClass) -> Result<()> {
        self.batch.stage(Object::StorageClass(class));
        Ok(())
    }

    fn handle_mount(&mut self, storage_name: &str, mount: VolumeMount) -> Result<()> {
        self.pod.attach(storage_name, mount);
        Ok(())
    }
}
