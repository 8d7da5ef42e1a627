use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;

use app_reconciler::k8s::{Object, ResourceKind};
use app_reconciler::test_support::FakeCluster;
use app_reconciler::{AppIdentity, Application, ApplicationConfig, ContainerConfig, DeploymentTopology, ServiceParam, ServicePort};
use k8s_openapi::api::core::v1::{PodSpec, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

fn app(cluster: &FakeCluster, topology: DeploymentTopology) -> Application {
    Application::new(AppIdentity::new("db", "models", topology), Arc::new(cluster.clone()))
}

fn config() -> ApplicationConfig {
    ApplicationConfig {
        agent_version: "3.1.0".into(),
        agent_image_path: "registry/agent:3.1.0".into(),
        charm_base_image: "registry/charm-base:22.04".into(),
        containers: BTreeMap::from([("postgres".to_string(), ContainerConfig { image: "postgres:15".into(), mounts: vec![] })]),
        ..Default::default()
    }
}

fn http() -> Vec<ServicePort> {
    vec![ServicePort { name: "http".into(), port: 80, target_port: 8080, protocol: "TCP".into() }]
}

fn default_service(cluster: &FakeCluster) -> Service {
    match cluster.object(ResourceKind::Service, "models", "db") {
        Some(Object::Service(svc)) => svc,
        other => panic!("expected service, got {other:?}"),
    }
}

fn template(cluster: &FakeCluster, kind: ResourceKind) -> PodSpec {
    let spec = match cluster.object(kind, "models", "db") {
        Some(Object::StatefulSet(o)) => o.spec.map(|s| s.template),
        Some(Object::Deployment(o)) => o.spec.map(|s| s.template),
        Some(Object::DaemonSet(o)) => o.spec.map(|s| s.template),
        other => panic!("expected workload, got {other:?}"),
    };
    spec.and_then(|t| t.spec).expect("pod template")
}

#[tokio::test]
async fn ports_reach_service_and_workload_containers() {
    let cluster = FakeCluster::new();
    let app = app(&cluster, DeploymentTopology::Stateful);
    app.ensure(&config()).await.unwrap();

    app.update_ports(&http(), true).await.unwrap();
    let ports = default_service(&cluster).spec.unwrap().ports.unwrap();
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].port, 80);
    assert_eq!(ports[0].target_port, Some(IntOrString::Int(8080)));

    let pod = template(&cluster, ResourceKind::StatefulSet);
    let charm = pod.containers.iter().find(|c| c.name == "charm").unwrap();
    let postgres = pod.containers.iter().find(|c| c.name == "postgres").unwrap();
    assert!(charm.ports.as_ref().map_or(true, |p| p.iter().all(|p| p.container_port != 8080)));
    let container_ports = postgres.ports.as_ref().unwrap();
    assert_eq!(container_ports[0].container_port, 8080);
    assert_eq!(container_ports[0].name.as_deref(), Some("http"));
}

#[tokio::test]
async fn service_only_update_leaves_workload_alone() {
    let cluster = FakeCluster::new();
    let app = app(&cluster, DeploymentTopology::Stateless);
    app.ensure(&config()).await.unwrap();
    cluster.clear_log();

    app.update_ports(&http(), false).await.unwrap();
    assert_eq!(cluster.log(), ["apply Service/models/db"]);
    let pod = template(&cluster, ResourceKind::Deployment);
    assert!(pod.containers.iter().all(|c| c.ports.is_none()));
}

#[tokio::test]
async fn service_type_change_also_updates_containers() {
    let cluster = FakeCluster::new();
    let app = app(&cluster, DeploymentTopology::Daemon);
    app.ensure(&config()).await.unwrap();

    app.update_service(&ServiceParam { service_type: "LoadBalancer".into(), ports: http() }).await.unwrap();
    let spec = default_service(&cluster).spec.unwrap();
    assert_eq!(spec.type_.as_deref(), Some("LoadBalancer"));
    let pod = template(&cluster, ResourceKind::DaemonSet);
    let postgres = pod.containers.iter().find(|c| c.name == "postgres").unwrap();
    assert_eq!(postgres.ports.as_ref().unwrap()[0].container_port, 8080);
}

#[tokio::test]
async fn missing_service_is_not_found_with_context() {
    let cluster = FakeCluster::new();
    let err = app(&cluster, DeploymentTopology::Stateful).update_ports(&http(), true).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(err.to_string().starts_with("getting existing service \"db\""), "{err}");
    assert!(cluster.log().is_empty());
}

#[tokio::test]
async fn watches_select_by_name_or_labels() {
    let cluster = FakeCluster::new();
    let app = app(&cluster, DeploymentTopology::Stateful);

    let mut changes = app.watch().unwrap();
    assert!(changes.next().await.unwrap().is_ok());
    app.watch_replicas().unwrap();

    let log = cluster.log();
    assert_eq!(log.len(), 2);
    assert!(log[0].starts_with("watch StatefulSet models Fields"), "{}", log[0]);
    assert!(log[0].contains("metadata.name=db,metadata.namespace=models"));
    assert!(log[1].starts_with("watch Pod models Labels"), "{}", log[1]);
    assert!(log[1].contains("app.kubernetes.io/name=db"));
}
