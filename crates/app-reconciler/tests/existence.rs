use std::sync::Arc;

use app_reconciler::k8s::{Object, ResourceKind};
use app_reconciler::test_support::FakeCluster;
use app_reconciler::{AppIdentity, Application, DeploymentState, DeploymentTopology};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta { name: Some(name.into()), namespace: Some("models".into()), ..Default::default() }
}

fn app(cluster: &FakeCluster, topology: DeploymentTopology) -> Application {
    Application::new(AppIdentity::new("db", "models", topology), Arc::new(cluster.clone()))
}

const ABSENT: DeploymentState = DeploymentState { exists: false, terminating: false };
const PRESENT: DeploymentState = DeploymentState { exists: true, terminating: false };
const TERMINATING: DeploymentState = DeploymentState { exists: true, terminating: true };

#[tokio::test]
async fn nothing_deployed_means_absent() {
    for topology in [DeploymentTopology::Stateful, DeploymentTopology::Stateless, DeploymentTopology::Daemon] {
        assert_eq!(app(&FakeCluster::new(), topology).exists().await.unwrap(), ABSENT);
    }
}

#[tokio::test]
async fn any_leftover_resource_means_present() {
    let cluster = FakeCluster::new();
    cluster.insert(Object::Secret(Secret { metadata: meta("db-application-config"), ..Default::default() }));
    assert_eq!(app(&cluster, DeploymentTopology::Stateless).exists().await.unwrap(), PRESENT);

    let cluster = FakeCluster::new();
    cluster.insert(Object::Service(Service { metadata: meta("db"), ..Default::default() }));
    assert_eq!(app(&cluster, DeploymentTopology::Daemon).exists().await.unwrap(), PRESENT);
}

#[tokio::test]
async fn primary_workload_follows_topology() {
    let cluster = FakeCluster::new();
    cluster.insert(Object::Deployment(Deployment { metadata: meta("db"), ..Default::default() }));
    assert_eq!(app(&cluster, DeploymentTopology::Stateless).exists().await.unwrap(), PRESENT);
    // a Deployment is not the workload of a stateful or daemon app
    assert_eq!(app(&cluster, DeploymentTopology::Stateful).exists().await.unwrap(), ABSENT);
    assert_eq!(app(&cluster, DeploymentTopology::Daemon).exists().await.unwrap(), ABSENT);

    cluster.insert(Object::DaemonSet(DaemonSet { metadata: meta("db"), ..Default::default() }));
    assert_eq!(app(&cluster, DeploymentTopology::Daemon).exists().await.unwrap(), PRESENT);
}

#[tokio::test]
async fn deleting_resource_short_circuits_to_terminating() {
    let cluster = FakeCluster::new();
    cluster.insert(Object::StatefulSet(StatefulSet { metadata: meta("db"), ..Default::default() }));
    cluster.insert(Object::Secret(Secret { metadata: meta("db-application-config"), ..Default::default() }));
    cluster.mark_deleting(ResourceKind::Secret, "models", "db-application-config");
    assert_eq!(app(&cluster, DeploymentTopology::Stateful).exists().await.unwrap(), TERMINATING);

    let cluster = FakeCluster::new();
    cluster.insert(Object::StatefulSet(StatefulSet { metadata: meta("db"), ..Default::default() }));
    cluster.mark_deleting(ResourceKind::StatefulSet, "models", "db");
    // the failing service check is never reached
    cluster.fail_gets_of(ResourceKind::Service, "db");
    assert_eq!(app(&cluster, DeploymentTopology::Stateful).exists().await.unwrap(), TERMINATING);
}

#[tokio::test]
async fn lookup_failures_name_the_check() {
    let cluster = FakeCluster::new();
    cluster.fail_gets_of(ResourceKind::Secret, "db-application-config");
    let err = app(&cluster, DeploymentTopology::Stateless).exists().await.unwrap_err();
    assert!(!err.is_not_found());
    assert!(err.to_string().starts_with("secret resource check: "), "{err}");

    let cluster = FakeCluster::new();
    cluster.fail_gets_of(ResourceKind::DaemonSet, "db");
    let err = app(&cluster, DeploymentTopology::Daemon).exists().await.unwrap_err();
    assert!(err.to_string().starts_with("daemonset resource check: "), "{err}");
}
