use k8s_openapi::api::core::v1::{Pod, Volume};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::application::{Application, Workload};
use crate::error::{Error, Result, ResultExt};
use crate::k8s::PodListParams;
use crate::models::{ApplicationState, DeploymentTopology, Unit};
use crate::naming;
use crate::podspec::{CHARM_VOLUME, SUPERVISOR_CONTAINER};

/// Desired replica count plus the names of every pod currently selected.
pub async fn state(app: &Application) -> Result<ApplicationState> {
    let desired_replicas = match app.get_workload().await? {
        Workload::StatefulSet(o) => o.spec.and_then(|s| s.replicas).ok_or_else(|| Error::invariant("missing replicas"))?,
        Workload::Deployment(o) => o.spec.and_then(|s| s.replicas).ok_or_else(|| Error::invariant("missing replicas"))?,
        Workload::DaemonSet(o) => o.status.map(|s| s.desired_number_scheduled).unwrap_or(0),
    };
    let mut replicas: Vec<String> = list_pods(app).await?.into_iter().filter_map(|p| p.metadata.name).collect();
    replicas.sort();
    replicas.dedup();
    Ok(ApplicationState { desired_replicas, replicas })
}

/// Follow continue tokens until the server reports nothing remaining.
pub(crate) async fn list_pods(app: &Application) -> Result<Vec<Pod>> {
    let mut params = PodListParams { label_selector: app.label_selector(), ..Default::default() };
    let mut pods = Vec::new();
    loop {
        let page = app.cluster.list_pods(app.namespace(), &params).await?;
        debug!(count = page.items.len(), remaining = ?page.remaining_item_count, "pods.page");
        pods.extend(page.items);
        match (page.remaining_item_count, page.continue_token) {
            (Some(remaining), Some(token)) if remaining > 0 && !token.is_empty() => params.continue_token = Some(token),
            (Some(remaining), _) if remaining > 0 => {
                warn!(remaining, "pods.page.no_continue_token");
                break;
            }
            _ => break,
        }
    }
    Ok(pods)
}

/// One `Unit` per selected pod, with the filesystems mounted on the
/// supervisor container.
pub async fn units(app: &Application) -> Result<Vec<Unit>> {
    if let DeploymentTopology::Unrecognized(_) = app.identity.topology {
        return Err(app.unsupported());
    }
    let now = app.clock.now();
    let stateful = app.identity.topology == DeploymentTopology::Stateful;
    let mut units = Vec::new();
    for pod in list_pods(app).await? {
        let id = pod.metadata.name.clone().unwrap_or_default();
        let containers = pod.spec.as_ref().map(|s| s.containers.as_slice()).unwrap_or_default();
        let ports = containers
            .iter()
            .flat_map(|c| c.ports.iter().flatten())
            .map(|p| format!("{}/{}", p.container_port, p.protocol.as_deref().unwrap_or("TCP")))
            .collect();
        let status = app.pod_status.pod_status(&pod, now).await?;
        let mut unit = Unit {
            address: pod.status.as_ref().and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
            ports,
            dying: pod.metadata.deletion_timestamp.is_some(),
            stateful,
            status,
            filesystems: Vec::new(),
            id,
        };

        let volumes: BTreeMap<&str, &Volume> = pod
            .spec
            .as_ref()
            .and_then(|s| s.volumes.as_ref())
            .map(|vs| vs.iter().map(|v| (v.name.as_str(), v)).collect())
            .unwrap_or_default();
        let supervisor = containers.iter().find(|c| c.name == SUPERVISOR_CONTAINER).or(containers.first());
        let mounts = supervisor.and_then(|c| c.volume_mounts.as_deref()).unwrap_or_default();
        for mount in mounts.iter().filter(|m| m.name != CHARM_VOLUME) {
            let Some(volume) = volumes.get(mount.name.as_str()) else {
                warn!(unit = %unit.id, mount = %mount.name, "volume for volume mount not found");
                continue;
            };
            let info = app
                .filesystems
                .filesystem_info(app.namespace(), &pod, volume, mount, now)
                .await
                .with_context(|| format!("finding filesystem info for {}", mount.name))?;
            let Some(mut info) = info else { continue };
            if info.storage_name.is_empty() {
                match naming::storage_name_from_mount(app.name(), &mount.name) {
                    Some(name) => info.storage_name = name,
                    None => {
                        warn!(unit = %unit.id, mount = %mount.name, "cannot infer storage name from mount");
                        continue;
                    }
                }
            }
            debug!(unit = %unit.id, mount = %mount.name, storage = %info.storage_name, "unit.filesystem");
            unit.filesystems.push(info);
        }
        units.push(unit);
    }
    Ok(units)
}
