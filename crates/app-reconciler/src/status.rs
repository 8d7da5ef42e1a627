//! Per-pod status and filesystem lookups, plus the clock.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::k8s::ClusterClient;
use crate::models::{FilesystemInfo, StatusInfo};
use crate::naming;

#[async_trait]
pub trait PodStatusSource: Send + Sync {
    async fn pod_status(&self, pod: &Pod, now: DateTime<Utc>) -> Result<StatusInfo>;
}

/// Resolves one mounted volume of a pod to filesystem details.
/// `Ok(None)` means the volume is not a filesystem the engine reports on.
#[async_trait]
pub trait FilesystemInfoSource: Send + Sync {
    async fn filesystem_info(
        &self,
        namespace: &str,
        pod: &Pod,
        volume: &Volume,
        mount: &VolumeMount,
        now: DateTime<Utc>,
    ) -> Result<Option<FilesystemInfo>>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> { Utc::now() }
}

/// Eight lowercase hex characters taken from a fresh v4 UUID.
pub fn random_prefix() -> String { uuid::Uuid::new_v4().simple().to_string()[..8].to_string() }

const ERROR_REASONS: &[&str] =
    &["ErrImagePull", "ImagePullBackOff", "InvalidImageName", "CrashLoopBackOff", "CreateContainerConfigError", "CreateContainerError"];

/// Maps pod phase and container states onto a unit status.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPodStatus;

#[async_trait]
impl PodStatusSource for DefaultPodStatus {
    async fn pod_status(&self, pod: &Pod, now: DateTime<Utc>) -> Result<StatusInfo> { Ok(derive_pod_status(pod, now)) }
}

pub fn derive_pod_status(pod: &Pod, now: DateTime<Utc>) -> StatusInfo {
    let status = pod.status.as_ref();
    let since = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|cs| cs.iter().filter_map(|c| c.last_transition_time.as_ref().map(|t| t.0)).max())
        .unwrap_or(now);
    if pod.metadata.deletion_timestamp.is_some() {
        return StatusInfo { status: "terminated".into(), message: String::new(), since };
    }

    // First container that is waiting or has terminated explains the phase.
    let reason = status
        .into_iter()
        .flat_map(|s| s.init_container_statuses.iter().flatten().chain(s.container_statuses.iter().flatten()))
        .find_map(|cs| {
            let state = cs.state.as_ref()?;
            if let Some(w) = &state.waiting {
                return Some((w.reason.clone().unwrap_or_default(), w.message.clone().unwrap_or_default()));
            }
            state.terminated.as_ref().filter(|t| t.exit_code != 0)
                .map(|t| (t.reason.clone().unwrap_or_default(), t.message.clone().unwrap_or_default()))
        });

    let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or("Unknown");
    let mut label = match phase {
        "Running" => "running",
        "Pending" => "allocating",
        "Failed" => "error",
        "Succeeded" => "terminated",
        _ => "unknown",
    };
    if matches!(&reason, Some((r, _)) if ERROR_REASONS.contains(&r.as_str())) {
        label = "error";
    }
    let message = status
        .and_then(|s| s.message.clone())
        .filter(|m| !m.is_empty())
        .or_else(|| reason.map(|(r, m)| if m.is_empty() { r } else { format!("{r}: {m}") }))
        .unwrap_or_default();
    StatusInfo { status: label.into(), message, since }
}

/// Reports claim-backed volumes by reading the claim, and emptyDir volumes as
/// attached scratch space.
#[derive(Clone)]
pub struct ClaimFilesystemInfo {
    cluster: Arc<dyn ClusterClient>,
}

impl ClaimFilesystemInfo {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self { Self { cluster } }
}

#[async_trait]
impl FilesystemInfoSource for ClaimFilesystemInfo {
    async fn filesystem_info(
        &self,
        namespace: &str,
        _pod: &Pod,
        volume: &Volume,
        mount: &VolumeMount,
        now: DateTime<Utc>,
    ) -> Result<Option<FilesystemInfo>> {
        if let Some(source) = &volume.persistent_volume_claim {
            let claim = match self.cluster.get_persistent_volume_claim(namespace, &source.claim_name).await {
                Ok(c) => c,
                Err(e) if e.is_not_found() => {
                    debug!(claim = %source.claim_name, "filesystem.claim.absent");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };
            return Ok(Some(claim_info(&claim, mount, now)));
        }
        if let Some(empty) = &volume.empty_dir {
            return Ok(Some(FilesystemInfo {
                storage_name: String::new(),
                filesystem_id: volume.name.clone(),
                size: empty.size_limit.as_ref().and_then(quantity_mib).unwrap_or(0),
                mount_point: mount.mount_path.clone(),
                read_only: mount.read_only.unwrap_or(false),
                status: StatusInfo { status: "attached".into(), message: String::new(), since: now },
            }));
        }
        Ok(None)
    }
}

fn claim_info(claim: &PersistentVolumeClaim, mount: &VolumeMount, now: DateTime<Utc>) -> FilesystemInfo {
    let labels = claim.metadata.labels.as_ref();
    let storage_name = [naming::LABEL_STORAGE, naming::LEGACY_LABEL_STORAGE]
        .iter()
        .find_map(|k| labels.and_then(|l| l.get(*k)))
        .cloned()
        .unwrap_or_default();
    let capacity = claim.status.as_ref().and_then(|s| s.capacity.as_ref()).and_then(|c| c.get("storage"));
    let requested = claim.spec.as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"));
    let size = capacity.or(requested).and_then(quantity_mib).unwrap_or(0);
    let phase = claim.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or("");
    let status = match phase {
        "Bound" => "attached",
        "Pending" => "pending",
        "Lost" => "error",
        _ => "unknown",
    };
    let filesystem_id = claim.spec.as_ref()
        .and_then(|s| s.volume_name.clone())
        .or_else(|| claim.metadata.name.clone())
        .unwrap_or_default();
    FilesystemInfo {
        storage_name,
        filesystem_id,
        size,
        mount_point: mount.mount_path.clone(),
        read_only: mount.read_only.unwrap_or(false),
        status: StatusInfo { status: status.into(), message: String::new(), since: now },
    }
}

/// Parse a storage quantity into whole MiB, rounding up.
pub fn quantity_mib(q: &Quantity) -> Option<u64> {
    let raw = q.0.trim();
    let split = raw.find(|c: char| c.is_ascii_alphabetic()).unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let value: f64 = number.parse().ok()?;
    let factor: f64 = match suffix {
        "" => 1.0,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * factor / (1024.0 * 1024.0)).ceil() as u64)
}
