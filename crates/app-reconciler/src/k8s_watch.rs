use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, Resource};
use kube_runtime::watcher::{watcher, Config, Event};
use serde::de::DeserializeOwned;
use std::fmt::Debug;

use crate::error::{Error, Result};
use crate::k8s::{ResourceKind, WatchSelector};

/// One notification per observed change; the payload is deliberately dropped,
/// consumers re-read whatever state they need.
pub(crate) fn watch(client: Client, kind: ResourceKind, namespace: &str, selector: WatchSelector) -> Result<BoxStream<'static, Result<()>>> {
    let config = match &selector {
        WatchSelector::Fields(f) => Config::default().fields(f),
        WatchSelector::Labels(l) => Config::default().labels(l),
    };
    tracing::debug!(%kind, namespace, ?selector, "watch.start");
    Ok(match kind {
        ResourceKind::StatefulSet => notify::<StatefulSet>(Api::namespaced(client, namespace), config),
        ResourceKind::Deployment => notify::<Deployment>(Api::namespaced(client, namespace), config),
        ResourceKind::DaemonSet => notify::<DaemonSet>(Api::namespaced(client, namespace), config),
        ResourceKind::Pod => notify::<Pod>(Api::namespaced(client, namespace), config),
        other => return Err(Error::not_supported(format!("watching {other}"))),
    })
}

fn notify<K>(api: Api<K>, config: Config) -> BoxStream<'static, Result<()>>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher(api, config)
        .try_filter(|ev| futures_util::future::ready(is_change(ev)))
        .map_ok(|_| ())
        .map_err(Error::from)
        .boxed()
}

// Init/InitDone bracket a relist; only the objects inside it are changes.
fn is_change<K>(ev: &Event<K>) -> bool {
    matches!(ev, Event::Apply(_) | Event::Delete(_) | Event::InitApply(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relist_markers_are_not_changes() {
        assert!(!is_change::<Pod>(&Event::Init));
        assert!(!is_change::<Pod>(&Event::InitDone));
        assert!(is_change(&Event::Apply(Pod::default())));
        assert!(is_change(&Event::Delete(Pod::default())));
        assert!(is_change(&Event::InitApply(Pod::default())));
    }
}
