use k8s_openapi::api::core::v1::{ContainerPort, ServicePort as KubeServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::debug;

use crate::application::Application;
use crate::batch::Batch;
use crate::error::{Error, Result, ResultExt};
use crate::k8s::Object;
use crate::models::{ServiceParam, ServicePort};
use crate::podspec::SUPERVISOR_CONTAINER;

fn to_service_port(p: &ServicePort) -> KubeServicePort {
    KubeServicePort {
        name: Some(p.name.clone()).filter(|n| !n.is_empty()),
        port: p.port,
        target_port: Some(IntOrString::Int(p.target_port)),
        protocol: Some(p.protocol.clone()).filter(|p| !p.is_empty()),
        ..Default::default()
    }
}

fn to_container_port(p: &KubeServicePort) -> ContainerPort {
    let container_port = match &p.target_port {
        Some(IntOrString::Int(port)) => *port,
        _ => p.port,
    };
    ContainerPort { name: p.name.clone(), container_port, protocol: p.protocol.clone(), ..Default::default() }
}

/// Replace the default service's ports, optionally mirroring them onto the
/// workload containers.
pub async fn update_ports(app: &Application, ports: &[ServicePort], update_container_ports: bool) -> Result<()> {
    apply_service(app, None, ports, update_container_ports).await
}

/// Change the default service type and ports; container ports always follow.
pub async fn update_service(app: &Application, param: &ServiceParam) -> Result<()> {
    apply_service(app, Some(&param.service_type), &param.ports, true).await
}

async fn apply_service(app: &Application, service_type: Option<&str>, ports: &[ServicePort], update_container_ports: bool) -> Result<()> {
    let name = app.name();
    let mut svc = app
        .cluster
        .get_service(app.namespace(), name)
        .await
        .with_context(|| format!("getting existing service {name:?}"))?;
    let service_ports: Vec<KubeServicePort> = ports.iter().map(to_service_port).collect();
    let spec = svc.spec.get_or_insert_with(Default::default);
    if let Some(t) = service_type {
        spec.type_ = Some(t.to_string());
    }
    spec.ports = Some(service_ports.clone());
    debug!(ports = service_ports.len(), ?service_type, "service.ports.update");

    let mut batch = Batch::new(app.cluster.as_ref());
    batch.stage(Object::Service(svc));
    if update_container_ports {
        let container_ports: Vec<ContainerPort> = service_ports.iter().map(to_container_port).collect();
        let mut workload = app.get_workload().await?;
        let pod = workload
            .pod_spec_mut()
            .ok_or_else(|| Error::invariant(format!("workload {name:?} has no pod template")))?;
        for container in pod.containers.iter_mut().filter(|c| c.name != SUPERVISOR_CONTAINER) {
            container.ports = Some(container_ports.clone());
        }
        batch.stage(workload.into_object());
    }
    batch.run(false).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_convert_to_container_ports() {
        let svc = to_service_port(&ServicePort { name: "http".into(), port: 80, target_port: 8080, protocol: "TCP".into() });
        assert_eq!(svc.target_port, Some(IntOrString::Int(8080)));
        let c = to_container_port(&svc);
        assert_eq!(c.container_port, 8080);
        assert_eq!(c.name.as_deref(), Some("http"));
        assert_eq!(c.protocol.as_deref(), Some("TCP"));
    }
}
