use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use app_reconciler::k8s::Object;
use app_reconciler::naming;
use app_reconciler::test_support::{pod, FakeCluster, FixedClock, StaticFilesystemInfo, StaticPodStatus};
use app_reconciler::{AppIdentity, Application, DeploymentTopology, Error, FilesystemInfo, StatusInfo};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetStatus, Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus,
    PersistentVolumeClaimVolumeSource, PodSpec, PodStatus, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta { name: Some(name.into()), namespace: Some("models".into()), ..Default::default() }
}

fn now() -> DateTime<Utc> { DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z").unwrap().with_timezone(&Utc) }

fn app(cluster: &FakeCluster, topology: DeploymentTopology) -> Application {
    Application::new(AppIdentity::new("db", "models", topology), Arc::new(cluster.clone())).with_clock(Arc::new(FixedClock(now())))
}

fn selector() -> naming::Labels { naming::selector_labels_for_app("db", false) }

fn stateful(replicas: Option<i32>) -> Object {
    Object::StatefulSet(StatefulSet { metadata: meta("db"), spec: Some(StatefulSetSpec { replicas, ..Default::default() }), ..Default::default() })
}

#[tokio::test]
async fn state_collects_every_page_sorted() {
    let cluster = FakeCluster::new().with_page_size(2);
    cluster.insert(stateful(Some(5)));
    for name in ["db-4", "db-1", "db-3", "db-0", "db-2"] {
        cluster.add_pod("models", pod(name, &selector()));
    }
    cluster.add_pod("models", pod("other-0", &naming::selector_labels_for_app("other", false)));

    let state = app(&cluster, DeploymentTopology::Stateful).state().await.unwrap();
    assert_eq!(state.desired_replicas, 5);
    assert_eq!(state.replicas, ["db-0", "db-1", "db-2", "db-3", "db-4"]);
    assert_eq!(cluster.list_calls(), 3);
}

#[tokio::test]
async fn duplicate_pod_names_are_reported_once() {
    let cluster = FakeCluster::new().with_page_size(1);
    cluster.insert(stateful(Some(1)));
    cluster.add_pod("models", pod("db-0", &selector()));
    cluster.add_pod("models", pod("db-0", &selector()));
    let state = app(&cluster, DeploymentTopology::Stateful).state().await.unwrap();
    assert_eq!(state.replicas, ["db-0"]);
}

#[tokio::test]
async fn missing_replicas_is_an_error() {
    let cluster = FakeCluster::new();
    cluster.insert(Object::Deployment(Deployment { metadata: meta("db"), spec: Some(DeploymentSpec::default()), ..Default::default() }));
    let err = app(&cluster, DeploymentTopology::Stateless).state().await.unwrap_err();
    assert!(matches!(err, Error::Invariant(ref m) if m == "missing replicas"));

    let cluster = FakeCluster::new();
    cluster.insert(stateful(None));
    assert!(app(&cluster, DeploymentTopology::Stateful).state().await.is_err());
}

#[tokio::test]
async fn daemon_desired_count_comes_from_status() {
    let cluster = FakeCluster::new();
    cluster.insert(Object::DaemonSet(DaemonSet {
        metadata: meta("db"),
        status: Some(DaemonSetStatus { desired_number_scheduled: 4, ..Default::default() }),
        ..Default::default()
    }));
    assert_eq!(app(&cluster, DeploymentTopology::Daemon).state().await.unwrap().desired_replicas, 4);

    let cluster = FakeCluster::new();
    cluster.insert(Object::DaemonSet(DaemonSet { metadata: meta("db"), ..Default::default() }));
    assert_eq!(app(&cluster, DeploymentTopology::Daemon).state().await.unwrap().desired_replicas, 0);
}

#[tokio::test]
async fn state_of_missing_workload_is_not_found() {
    let err = app(&FakeCluster::new(), DeploymentTopology::Stateful).state().await.unwrap_err();
    assert!(err.is_not_found());
}

fn claim_volume(name: &str) -> Volume {
    Volume {
        name: name.into(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource { claim_name: name.into(), ..Default::default() }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount { VolumeMount { name: name.into(), mount_path: path.into(), ..Default::default() } }

fn unit_pod() -> k8s_openapi::api::core::v1::Pod {
    let mut p = pod("db-0", &selector());
    p.spec = Some(PodSpec {
        containers: vec![
            Container {
                name: "charm".into(),
                volume_mounts: Some(vec![
                    mount("charm-data", "/charm/bin"),
                    mount("db-data-abcd1234", "/srv/data"),
                    mount("juju-logs-0", "/srv/logs"),
                    mount("db-cache", "/srv/cache"),
                    mount("missing", "/srv/missing"),
                    mount("db-Bad_Name", "/srv/bad"),
                ]),
                ..Default::default()
            },
            Container {
                name: "postgres".into(),
                ports: Some(vec![
                    ContainerPort { container_port: 5432, protocol: Some("TCP".into()), ..Default::default() },
                    ContainerPort { container_port: 9187, ..Default::default() },
                ]),
                ..Default::default()
            },
        ],
        volumes: Some(vec![
            Volume { name: "charm-data".into(), empty_dir: Some(Default::default()), ..Default::default() },
            claim_volume("db-data-abcd1234"),
            claim_volume("juju-logs-0"),
            claim_volume("db-cache"),
            claim_volume("db-Bad_Name"),
        ]),
        ..Default::default()
    });
    p.status = Some(PodStatus { pod_ip: Some("10.1.2.3".into()), ..Default::default() });
    p
}

fn info(id: &str, storage_name: &str) -> FilesystemInfo {
    FilesystemInfo {
        storage_name: storage_name.into(),
        filesystem_id: id.into(),
        size: 1024,
        mount_point: String::new(),
        read_only: false,
        status: StatusInfo { status: "attached".into(), message: String::new(), since: now() },
    }
}

#[tokio::test]
async fn units_report_ports_status_and_inferred_storage() {
    let cluster = FakeCluster::new();
    cluster.add_pod("models", unit_pod());
    let mut dying = pod("db-1", &selector());
    dying.metadata.deletion_timestamp = Some(Time(now()));
    cluster.add_pod("models", dying);

    let filesystems = StaticFilesystemInfo(BTreeMap::from([
        ("db-data-abcd1234".to_string(), info("pv-1", "")),
        ("juju-logs-0".to_string(), info("pv-2", "")),
        ("db-cache".to_string(), info("pv-3", "cache-explicit")),
        ("db-Bad_Name".to_string(), info("pv-4", "")),
    ]));
    let app = app(&cluster, DeploymentTopology::Stateful)
        .with_pod_status(Arc::new(StaticPodStatus("running".into())))
        .with_filesystem_info(Arc::new(filesystems));
    let units = app.units().await.unwrap();
    assert_eq!(units.len(), 2);

    let unit = &units[0];
    assert_eq!(unit.id, "db-0");
    assert_eq!(unit.address, "10.1.2.3");
    assert_eq!(unit.ports, ["5432/TCP", "9187/TCP"]);
    assert!(unit.stateful);
    assert!(!unit.dying);
    assert_eq!(unit.status.status, "running");
    assert_eq!(unit.status.since, now());
    let found: Vec<(&str, &str, &str)> = unit
        .filesystems
        .iter()
        .map(|f| (f.storage_name.as_str(), f.filesystem_id.as_str(), f.mount_point.as_str()))
        .collect();
    assert_eq!(found, [("data", "pv-1", "/srv/data"), ("logs", "pv-2", "/srv/logs"), ("cache-explicit", "pv-3", "/srv/cache")]);

    assert!(units[1].dying);
    assert!(units[1].filesystems.is_empty());
}

#[tokio::test]
async fn default_filesystem_info_reads_the_claim() {
    let cluster = FakeCluster::new();
    cluster.insert(Object::PersistentVolumeClaim(PersistentVolumeClaim {
        metadata: ObjectMeta {
            labels: Some(naming::labels_for_storage("data", false)),
            ..meta("db-data-abcd1234")
        },
        spec: Some(PersistentVolumeClaimSpec { volume_name: Some("pv-123".into()), ..Default::default() }),
        status: Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".into()),
            capacity: Some(BTreeMap::from([("storage".to_string(), Quantity("2Gi".into()))])),
            ..Default::default()
        }),
    }));
    let mut p = pod("db-0", &selector());
    p.spec = Some(PodSpec {
        containers: vec![Container { name: "charm".into(), volume_mounts: Some(vec![mount("db-data-abcd1234", "/srv/data")]), ..Default::default() }],
        volumes: Some(vec![claim_volume("db-data-abcd1234")]),
        ..Default::default()
    });
    cluster.add_pod("models", p);

    let units = app(&cluster, DeploymentTopology::Stateless).units().await.unwrap();
    let fs = &units[0].filesystems[0];
    assert_eq!(fs.storage_name, "data");
    assert_eq!(fs.filesystem_id, "pv-123");
    assert_eq!(fs.size, 2048);
    assert_eq!(fs.status.status, "attached");
    assert!(!units[0].stateful);
}
