//! Pod template shared by every topology.
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvFromSource, EnvVar, EnvVarSource, HTTPGetAction, ObjectFieldSelector, PodSpec,
    Probe, ResourceRequirements, SecretEnvSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::models::{ApplicationConfig, Constraints};
use crate::naming;

pub const SUPERVISOR_CONTAINER: &str = "charm";
pub const INIT_CONTAINER: &str = "charm-init";
pub const CHARM_VOLUME: &str = "charm-data";
pub const DATA_DIR: &str = "/var/lib/juju";
pub const PROBE_PORT: &str = "3856";

const PROBE_INITIAL_DELAY: i32 = 30;
const PROBE_PERIOD: i32 = 10;
const PROBE_SUCCESS: i32 = 1;
const PROBE_FAILURE: i32 = 2;

/// Build the pod spec for `app` from `config`.
///
/// Sidecars follow the supervisor in name order. Storage mounts are added
/// later by the storage handlers.
pub fn build_pod_spec(app: &str, config: &ApplicationConfig) -> Result<PodSpec> {
    let names = config.container_names().join(",");
    let mut containers = vec![supervisor(config, &names)];
    containers.extend(config.containers.iter().map(|(name, c)| sidecar(name, &c.image)));
    let node_selector = match config.constraints.arch.as_deref() {
        Some(arch) => Some(BTreeMap::from([(naming::ARCH_NODE_LABEL.to_string(), kube_arch(arch)?.to_string())])),
        None => None,
    };
    Ok(PodSpec {
        automount_service_account_token: Some(false),
        node_selector,
        init_containers: Some(vec![initializer(app, config, &names)]),
        containers,
        volumes: Some(vec![Volume {
            name: CHARM_VOLUME.into(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }]),
        ..Default::default()
    })
}

/// Normalise a machine architecture to the value of `kubernetes.io/arch`.
pub fn kube_arch(arch: &str) -> Result<&'static str> {
    match arch {
        "amd64" | "x86_64" => Ok("amd64"),
        "arm64" | "aarch64" => Ok("arm64"),
        "ppc64el" | "ppc64le" => Ok("ppc64le"),
        "s390x" => Ok("s390x"),
        other => Err(Error::not_supported(format!("architecture {other:?}"))),
    }
}

pub fn resource_requests(constraints: &Constraints) -> Option<BTreeMap<String, Quantity>> {
    let mut requests = BTreeMap::new();
    if let Some(cpu) = constraints.cpu_power {
        requests.insert("cpu".to_string(), Quantity(format!("{cpu}m")));
    }
    if let Some(mem) = constraints.mem {
        requests.insert("memory".to_string(), Quantity(format!("{mem}Mi")));
    }
    (!requests.is_empty()).then_some(requests)
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar { name: name.into(), value: Some(value.into()), ..Default::default() }
}

fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector { field_path: path.into(), ..Default::default() }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn charm_mount(path: &str, sub_path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: CHARM_VOLUME.into(),
        mount_path: path.into(),
        sub_path: Some(sub_path.into()),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

fn root() -> Option<SecurityContext> {
    Some(SecurityContext { run_as_user: Some(0), run_as_group: Some(0), ..Default::default() })
}

fn probe(path: &str) -> Option<Probe> {
    Some(Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.into()),
            port: IntOrString::String(PROBE_PORT.into()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(PROBE_INITIAL_DELAY),
        period_seconds: Some(PROBE_PERIOD),
        success_threshold: Some(PROBE_SUCCESS),
        failure_threshold: Some(PROBE_FAILURE),
        ..Default::default()
    })
}

fn data_sub_path() -> &'static str { DATA_DIR.trim_start_matches('/') }

fn supervisor(config: &ApplicationConfig, names: &str) -> Container {
    Container {
        name: SUPERVISOR_CONTAINER.into(),
        image_pull_policy: Some("IfNotPresent".into()),
        image: Some(config.charm_base_image.clone()),
        working_dir: Some(DATA_DIR.into()),
        command: Some(vec!["/charm/bin/containeragent".into()]),
        args: Some(vec![
            "unit".into(),
            "--data-dir".into(),
            DATA_DIR.into(),
            "--charm-modified-version".into(),
            config.charm_modified_version.to_string(),
            "--append-env".into(),
            "PATH=$PATH:/charm/bin".into(),
        ]),
        env: Some(vec![env("JUJU_CONTAINER_NAMES", names), env("HTTP_PROBE_PORT", PROBE_PORT)]),
        security_context: root(),
        liveness_probe: probe("/liveness"),
        readiness_probe: probe("/readiness"),
        startup_probe: probe("/startup"),
        volume_mounts: Some(vec![
            charm_mount("/charm/bin", "charm/bin", true),
            charm_mount(DATA_DIR, data_sub_path(), false),
            charm_mount("/charm/containers", "charm/containers", false),
        ]),
        resources: Some(ResourceRequirements { requests: resource_requests(&config.constraints), ..Default::default() }),
        ..Default::default()
    }
}

fn sidecar(name: &str, image: &str) -> Container {
    Container {
        name: name.into(),
        image_pull_policy: Some("IfNotPresent".into()),
        image: Some(image.into()),
        command: Some(vec!["/charm/bin/pebble".into()]),
        args: Some(vec!["run".into(), "--create-dirs".into(), "--hold".into()]),
        env: Some(vec![env("JUJU_CONTAINER_NAME", name), env("PEBBLE_SOCKET", "/charm/container/pebble.socket")]),
        // pebble is a service manager and must run as root
        security_context: root(),
        volume_mounts: Some(vec![
            charm_mount("/charm/bin/pebble", "charm/bin/pebble", true),
            charm_mount("/charm/container", &format!("charm/containers/{name}"), false),
        ]),
        ..Default::default()
    }
}

fn initializer(app: &str, config: &ApplicationConfig, names: &str) -> Container {
    Container {
        name: INIT_CONTAINER.into(),
        image_pull_policy: Some("IfNotPresent".into()),
        image: Some(config.agent_image_path.clone()),
        working_dir: Some(DATA_DIR.into()),
        command: Some(vec!["/opt/containeragent".into()]),
        args: Some(vec!["init".into(), "--data-dir".into(), DATA_DIR.into(), "--bin-dir".into(), "/charm/bin".into()]),
        env: Some(vec![
            env("JUJU_CONTAINER_NAMES", names),
            field_env("JUJU_K8S_POD_NAME", "metadata.name"),
            field_env("JUJU_K8S_POD_UUID", "metadata.uid"),
        ]),
        env_from: Some(vec![EnvFromSource {
            secret_ref: Some(SecretEnvSource { name: naming::secret_name(app), ..Default::default() }),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![
            charm_mount(DATA_DIR, data_sub_path(), false),
            charm_mount("/charm/bin", "charm/bin", false),
            charm_mount("/charm/containers", "charm/containers", false),
        ]),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContainerConfig;

    fn config() -> ApplicationConfig {
        ApplicationConfig {
            agent_image_path: "operator/agent:3.1".into(),
            charm_base_image: "charm-base:22.04".into(),
            charm_modified_version: 9,
            containers: BTreeMap::from([
                ("web".to_string(), ContainerConfig { image: "nginx:1".into(), mounts: vec![] }),
                ("gpu".to_string(), ContainerConfig { image: "cuda:12".into(), mounts: vec![] }),
            ]),
            ..Default::default()
        }
    }

    fn env_value<'a>(c: &'a Container, name: &str) -> Option<&'a str> {
        c.env.as_ref()?.iter().find(|e| e.name == name)?.value.as_deref()
    }

    #[test]
    fn containers_are_supervisor_then_sorted_sidecars() {
        let spec = build_pod_spec("db", &config()).unwrap();
        let names: Vec<_> = spec.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["charm", "gpu", "web"]);
        assert_eq!(env_value(&spec.containers[0], "JUJU_CONTAINER_NAMES"), Some("gpu,web"));
        assert_eq!(env_value(&spec.containers[0], "HTTP_PROBE_PORT"), Some("3856"));
        assert_eq!(env_value(&spec.containers[2], "JUJU_CONTAINER_NAME"), Some("web"));
        let args = spec.containers[0].args.clone().unwrap();
        assert!(args.windows(2).any(|w| w[0] == "--charm-modified-version" && w[1] == "9"));
        assert_eq!(spec.automount_service_account_token, Some(false));
        assert!(spec.node_selector.is_none());
    }

    #[test]
    fn initializer_reads_the_application_secret() {
        let spec = build_pod_spec("db", &config()).unwrap();
        let init = &spec.init_containers.unwrap()[0];
        assert_eq!(init.name, INIT_CONTAINER);
        assert_eq!(init.image.as_deref(), Some("operator/agent:3.1"));
        let secret = init.env_from.as_ref().unwrap()[0].secret_ref.as_ref().unwrap();
        assert_eq!(secret.name, "db-application-config");
        assert_eq!(init.volume_mounts.as_ref().unwrap().len(), 3);
    }

    #[test]
    fn constraints_become_requests_and_node_selector() {
        let mut cfg = config();
        cfg.constraints = Constraints { cpu_power: Some(500), mem: Some(1024), arch: Some("aarch64".into()) };
        let spec = build_pod_spec("db", &cfg).unwrap();
        let requests = spec.containers[0].resources.as_ref().unwrap().requests.clone().unwrap();
        assert_eq!(requests["cpu"], Quantity("500m".into()));
        assert_eq!(requests["memory"], Quantity("1024Mi".into()));
        assert_eq!(spec.node_selector.unwrap()[naming::ARCH_NODE_LABEL], "arm64");
    }

    #[test]
    fn unknown_architecture_is_not_supported() {
        let mut cfg = config();
        cfg.constraints.arch = Some("riscv64".into());
        let err = build_pod_spec("db", &cfg).unwrap_err();
        assert!(err.is_not_supported());
        assert_eq!(kube_arch("x86_64").unwrap(), "amd64");
        assert_eq!(kube_arch("ppc64el").unwrap(), "ppc64le");
    }
}
