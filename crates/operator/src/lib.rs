use app_reconciler::{AppIdentity, ApplicationConfig, ApplicationState, DeploymentState, DeploymentTopology};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod controller;
pub mod logging;

#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq)]
#[kube(
    group = "apps.reconciler.dev",
    version = "v1",
    kind = "ManagedApp",
    namespaced,
    status = "ManagedAppStatus",
    shortname = "mapp",
    printcolumn = r#"{"name":"Topology","type":"string","jsonPath":".spec.topology"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.desiredReplicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedAppSpec {
    pub topology: DeploymentTopology,
    /// Use the pre-2.9 label and annotation keys.
    #[serde(default)]
    pub legacy_labels: bool,
    #[serde(default)]
    pub model_uuid: String,
    #[serde(default)]
    pub model_name: String,
    pub config: ApplicationConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedAppStatus {
    pub observed_generation: Option<i64>,
    pub last_reconcile: Option<String>,
    #[serde(default)]
    pub exists: bool,
    #[serde(default)]
    pub desired_replicas: i32,
    #[serde(default)]
    pub replicas: Vec<String>,
}

impl ManagedApp {
    /// Engine identity of this resource; `None` until the object has a namespace.
    pub fn identity(&self) -> Option<AppIdentity> {
        let namespace = self.namespace()?;
        Some(
            AppIdentity::new(self.name_any(), namespace, self.spec.topology.clone())
                .with_model(self.spec.model_uuid.clone(), self.spec.model_name.clone())
                .with_legacy_labels(self.spec.legacy_labels),
        )
    }
}

impl ManagedAppStatus {
    pub fn observe(generation: Option<i64>, at: chrono::DateTime<chrono::Utc>, exists: DeploymentState, state: ApplicationState) -> Self {
        Self {
            observed_generation: generation,
            last_reconcile: Some(at.to_rfc3339()),
            exists: exists.exists,
            desired_replicas: state.desired_replicas,
            replicas: state.replicas,
        }
    }
}

// Re-export commonly used symbols for convenience in binaries/tests.
pub use ManagedAppSpec as Spec;
pub use ManagedAppStatus as Status;
