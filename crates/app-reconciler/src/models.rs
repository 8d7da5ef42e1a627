//! Caller-facing application model and the results the engine reports back.
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{Error, Result};

/// Storage provider accepted for declared filesystems.
pub const KUBERNETES_PROVIDER: &str = "kubernetes";

/// Replication/identity strategy of the workload.
///
/// Unknown values survive parsing as `Unrecognized` so that every operation
/// can refuse them explicitly instead of guessing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeploymentTopology {
    Stateful,
    Stateless,
    Daemon,
    Unrecognized(String),
}

impl DeploymentTopology {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Stateful => "stateful",
            Self::Stateless => "stateless",
            Self::Daemon => "daemon",
            Self::Unrecognized(s) => s,
        }
    }
}

impl From<&str> for DeploymentTopology {
    fn from(s: &str) -> Self {
        match s {
            "stateful" => Self::Stateful,
            "stateless" => Self::Stateless,
            "daemon" => Self::Daemon,
            other => Self::Unrecognized(other.to_string()),
        }
    }
}

impl fmt::Display for DeploymentTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl Serialize for DeploymentTopology {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> { s.serialize_str(self.as_str()) }
}

impl<'de> Deserialize<'de> for DeploymentTopology {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(Self::from(raw.as_str()))
    }
}

impl JsonSchema for DeploymentTopology {
    fn schema_name() -> String { "DeploymentTopology".into() }
    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema { String::json_schema(gen) }
}

/// Identity of one application; fixed for the lifetime of an `Application`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    pub name: String,
    pub namespace: String,
    pub model_uuid: String,
    pub model_name: String,
    pub legacy_labels: bool,
    pub topology: DeploymentTopology,
}

impl AppIdentity {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, topology: DeploymentTopology) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            model_uuid: String::new(),
            model_name: String::new(),
            legacy_labels: false,
            topology,
        }
    }

    pub fn with_model(mut self, uuid: impl Into<String>, name: impl Into<String>) -> Self {
        self.model_uuid = uuid.into();
        self.model_name = name.into();
        self
    }

    pub fn with_legacy_labels(mut self, legacy: bool) -> Self {
        self.legacy_labels = legacy;
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MountConfig {
    pub storage_name: String,
    pub path: String,
}

/// A sidecar workload container.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    pub image: String,
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemAttachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

fn default_provider() -> String { KUBERNETES_PROVIDER.to_string() }

/// A declared filesystem. Position in `ApplicationConfig::filesystems` feeds
/// the default mount path, so order matters.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemSpec {
    pub storage_name: String,
    /// Size in MiB.
    pub size: u64,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<FilesystemAttachment>,
    #[serde(default)]
    pub resource_tags: BTreeMap<String, String>,
}

impl FilesystemSpec {
    pub fn new(storage_name: impl Into<String>, size: u64) -> Self {
        Self {
            storage_name: storage_name.into(),
            size,
            provider: default_provider(),
            attributes: BTreeMap::new(),
            attachment: None,
            resource_tags: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn read_only(&self) -> bool { self.attachment.as_ref().map(|a| a.read_only).unwrap_or(false) }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Constraints {
    /// CPU request in millicores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_power: Option<u64>,
    /// Memory request in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
}

/// Everything `ensure` needs beyond the application identity.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationConfig {
    pub agent_version: String,
    /// Image of the initializer container.
    pub agent_image_path: String,
    /// Image of the supervisor container.
    pub charm_base_image: String,
    #[serde(default)]
    pub charm_modified_version: i64,
    #[serde(default)]
    pub introduction_secret: String,
    #[serde(default)]
    pub controller_addresses: String,
    #[serde(default)]
    pub controller_cert_bundle: String,
    #[serde(default)]
    pub containers: BTreeMap<String, ContainerConfig>,
    #[serde(default)]
    pub filesystems: Vec<FilesystemSpec>,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub resource_tags: BTreeMap<String, String>,
}

impl ApplicationConfig {
    /// Reject configurations the engine must never stage.
    pub fn validate(&self, app: &str) -> Result<()> {
        let mut seen = BTreeSet::new();
        for fs in &self.filesystems {
            if !seen.insert(fs.storage_name.as_str()) {
                return Err(Error::not_valid(format!("duplicated storage name {:?} for {:?}", fs.storage_name, app)));
            }
        }
        Ok(())
    }

    /// Sidecar names in the deterministic order used for env vars and containers.
    pub fn container_names(&self) -> Vec<&str> { self.containers.keys().map(String::as_str).collect() }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusInfo {
    pub status: String,
    pub message: String,
    pub since: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FilesystemInfo {
    pub storage_name: String,
    pub filesystem_id: String,
    /// Size in MiB.
    pub size: u64,
    pub mount_point: String,
    pub read_only: bool,
    pub status: StatusInfo,
}

/// A running replica as observed in the cluster.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub id: String,
    pub address: String,
    pub ports: Vec<String>,
    pub dying: bool,
    pub stateful: bool,
    pub status: StatusInfo,
    pub filesystems: Vec<FilesystemInfo>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationState {
    pub desired_replicas: i32,
    pub replicas: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeploymentState {
    pub exists: bool,
    pub terminating: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    pub name: String,
    pub port: i32,
    pub target_port: i32,
    pub protocol: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceParam {
    pub service_type: String,
    pub ports: Vec<ServicePort>,
}
