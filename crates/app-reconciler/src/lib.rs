//! Reconciles a declarative application description into Kubernetes
//! objects: a workload in one of three topologies, its services, its
//! configuration secret and its storage.
//!
//! ```no_run
//! # async fn demo() -> app_reconciler::Result<()> {
//! use std::sync::Arc;
//! use app_reconciler::{AppIdentity, Application, ApplicationConfig, DeploymentTopology, KubeCluster};
//!
//! let cluster = Arc::new(KubeCluster::try_default().await?);
//! let app = Application::new(AppIdentity::new("db", "models", DeploymentTopology::Stateful), cluster);
//! app.ensure(&ApplicationConfig::default()).await?;
//! let state = app.exists().await?;
//! # let _ = state;
//! # Ok(())
//! # }
//! ```
pub mod application;
pub mod batch;
pub mod error;
pub mod k8s;
mod k8s_watch;
pub mod models;
pub mod naming;
pub mod podspec;
pub mod services;
pub mod status;
pub mod storage;
pub mod telemetry;
pub mod test_support;

pub use application::{storage_unique_prefix, Application};
pub use error::{Error, Result};
pub use k8s::{ClusterClient, KubeCluster};
pub use models::{
    AppIdentity, ApplicationConfig, ApplicationState, Constraints, ContainerConfig, DeploymentState, DeploymentTopology,
    FilesystemAttachment, FilesystemInfo, FilesystemSpec, MountConfig, ServiceParam, ServicePort, StatusInfo, Unit,
};
