//! Drives `ManagedApp` objects through the reconciliation engine.
use app_reconciler::{Application, KubeCluster};
use futures_util::StreamExt;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::{Action, Controller};
use kube_runtime::finalizer::{finalizer, Event as Finalizer};
use kube_runtime::watcher::Config as WatcherConfig;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn};

use crate::config::OperatorConfig;
use crate::{ManagedApp, ManagedAppStatus};

pub const FINALIZER: &str = "apps.reconciler.dev/cleanup";

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("managed app {0:?} has no namespace")]
    MissingNamespace(String),
    #[error(transparent)]
    Engine(#[from] app_reconciler::Error),
    #[error("status update: {0}")]
    Status(#[source] kube::Error),
    #[error("finalizer: {0}")]
    Finalizer(#[source] Box<kube_runtime::finalizer::Error<ReconcileError>>),
}

pub struct Context {
    pub client: Client,
    pub config: OperatorConfig,
}

impl Context {
    fn application(&self, obj: &ManagedApp) -> Result<Application, ReconcileError> {
        let identity = obj.identity().ok_or_else(|| ReconcileError::MissingNamespace(obj.name_any()))?;
        let cluster = KubeCluster::new(self.client.clone()).with_field_manager(self.config.field_manager.clone());
        let span = info_span!("managed_app", app = %identity.name, namespace = %identity.namespace, topology = %identity.topology);
        Ok(Application::new(identity, Arc::new(cluster)).with_span(span))
    }
}

pub async fn reconcile(obj: Arc<ManagedApp>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let namespace = obj.namespace().ok_or_else(|| ReconcileError::MissingNamespace(obj.name_any()))?;
    let api: Api<ManagedApp> = Api::namespaced(ctx.client.clone(), &namespace);
    let status_api = api.clone();
    finalizer(&api, FINALIZER, obj, |event| async move {
        match event {
            Finalizer::Apply(app) => apply(&app, &ctx, &status_api).await,
            Finalizer::Cleanup(app) => cleanup(&app, &ctx).await,
        }
    })
    .await
    .map_err(|e| ReconcileError::Finalizer(Box::new(e)))
}

async fn apply(obj: &ManagedApp, ctx: &Context, api: &Api<ManagedApp>) -> Result<Action, ReconcileError> {
    let app = ctx.application(obj)?;
    app.ensure(&obj.spec.config).await?;
    let exists = app.exists().await?;
    let state = app.state().await?;
    let status = ManagedAppStatus::observe(obj.metadata.generation, chrono::Utc::now(), exists, state);
    debug!(app = %app.name(), desired = status.desired_replicas, running = status.replicas.len(), "status.patch");
    api.patch_status(&obj.name_any(), &PatchParams::default(), &Patch::Merge(json!({ "status": status })))
        .await
        .map_err(ReconcileError::Status)?;
    Ok(Action::requeue(Duration::from_secs(ctx.config.requeue_secs)))
}

async fn cleanup(obj: &ManagedApp, ctx: &Context) -> Result<Action, ReconcileError> {
    let app = ctx.application(obj)?;
    match app.delete().await {
        Ok(()) => info!(app = %app.name(), namespace = %app.namespace(), "managed_app.deleted"),
        // an unsupported topology never staged anything, so the finalizer can go
        Err(e) if e.is_not_supported() => warn!(app = %app.name(), error = %e, "managed_app.delete.skipped"),
        Err(e) => return Err(e.into()),
    }
    Ok(Action::await_change())
}

impl ReconcileError {
    /// Errors that retrying cannot fix; they wait for the object to change.
    pub fn is_permanent(&self) -> bool {
        use kube_runtime::finalizer::Error as FinalizerError;
        match self {
            Self::MissingNamespace(_) => true,
            Self::Engine(e) => e.is_not_supported() || e.is_not_valid(),
            Self::Status(_) => false,
            Self::Finalizer(inner) => match inner.as_ref() {
                FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e) => e.is_permanent(),
                FinalizerError::UnnamedObject | FinalizerError::InvalidFinalizer => true,
                _ => false,
            },
        }
    }
}

pub fn error_policy(obj: Arc<ManagedApp>, err: &ReconcileError, ctx: Arc<Context>) -> Action {
    if err.is_permanent() {
        warn!(app = %obj.name_any(), error = %err, "reconcile.failed.permanent");
        return Action::await_change();
    }
    warn!(app = %obj.name_any(), error = %err, "reconcile.failed");
    Action::requeue(Duration::from_secs(ctx.config.error_backoff_secs))
}

/// Run the controller until a shutdown signal arrives.
pub async fn run(client: Client, config: OperatorConfig) -> anyhow::Result<()> {
    let apps: Api<ManagedApp> = match &config.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    info!(namespace = ?config.namespace, field_manager = %config.field_manager, "controller.start");
    let ctx = Arc::new(Context { client, config });
    Controller::new(apps, WatcherConfig::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(app = %obj.name, "reconciled"),
                Err(e) => warn!(error = %e, "controller.error"),
            }
        })
        .await;
    info!("controller.stopped");
    debug!(metrics = %app_reconciler::telemetry::render(), "controller.metrics");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManagedAppSpec;
    use app_reconciler::{ApplicationConfig, DeploymentTopology, Error};

    fn context() -> Arc<Context> {
        let config = kube::Config::new("http://127.0.0.1:9".parse().unwrap());
        Arc::new(Context { client: Client::try_from(config).unwrap(), config: OperatorConfig::default() })
    }

    fn managed(topology: &str) -> Arc<ManagedApp> {
        let spec = ManagedAppSpec {
            topology: DeploymentTopology::from(topology),
            legacy_labels: false,
            model_uuid: String::new(),
            model_name: String::new(),
            config: ApplicationConfig::default(),
        };
        let mut app = ManagedApp::new("db", spec);
        app.metadata.namespace = Some("models".into());
        Arc::new(app)
    }

    #[tokio::test]
    async fn unsupported_topology_releases_the_finalizer() {
        let action = cleanup(&managed("cronjob"), &context()).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn invalid_or_unsupported_errors_wait_for_a_change() {
        let ctx = context();
        let unsupported = ReconcileError::Engine(Error::not_supported("deployment type \"cronjob\""));
        assert_eq!(error_policy(managed("cronjob"), &unsupported, ctx.clone()), Action::await_change());

        let duplicate = ReconcileError::Finalizer(Box::new(kube_runtime::finalizer::Error::ApplyFailed(
            ReconcileError::Engine(Error::not_valid("duplicated storage name \"data\"")),
        )));
        assert_eq!(error_policy(managed("stateful"), &duplicate, ctx.clone()), Action::await_change());
    }

    #[tokio::test]
    async fn transient_errors_are_retried_after_the_backoff() {
        let ctx = context();
        let transient = ReconcileError::Engine(Error::invariant("missing replicas"));
        assert!(!transient.is_permanent());
        assert_eq!(
            error_policy(managed("stateful"), &transient, ctx.clone()),
            Action::requeue(Duration::from_secs(ctx.config.error_backoff_secs))
        );
    }
}
