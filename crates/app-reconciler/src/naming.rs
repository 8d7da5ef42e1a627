//! Resource naming, labels and annotations shared by every owned object.
//!
//! These strings are an interoperability contract with already-deployed
//! applications; the legacy forms are selected by `AppIdentity::legacy_labels`.
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

pub type Labels = BTreeMap<String, String>;

pub const LABEL_APP: &str = "app.kubernetes.io/name";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LEGACY_LABEL_APP: &str = "juju-app";
pub const MANAGED_BY_VALUE: &str = "juju";

pub const LABEL_STORAGE: &str = "storage.juju.is/name";
pub const LEGACY_LABEL_STORAGE: &str = "juju-storage";
pub const LABEL_MODEL: &str = "model.juju.is/name";
pub const LEGACY_LABEL_MODEL: &str = "juju-model";

pub const ANNOTATION_STORAGE_PREFIX: &str = "app.juju.is/uuid";
pub const LEGACY_ANNOTATION_STORAGE_PREFIX: &str = "juju-app-uuid";
pub const ANNOTATION_VERSION: &str = "juju.is/version";
pub const LEGACY_ANNOTATION_VERSION: &str = "juju-version";
pub const ANNOTATION_MODEL_ID: &str = "model.juju.is/id";
pub const ANNOTATION_CONTROLLER_ID: &str = "controller.juju.is/id";
pub const LEGACY_ANNOTATION_MODEL_ID: &str = "juju-model";
pub const LEGACY_ANNOTATION_CONTROLLER_ID: &str = "juju-controller-uuid";
pub const TOLERATE_UNREADY_ANNOTATION: &str = "service.alpha.kubernetes.io/tolerate-unready-endpoints";

/// Resource tag keys rewritten into annotation keys.
pub const TAG_MODEL_UUID: &str = "juju-model-uuid";
pub const TAG_CONTROLLER_UUID: &str = "juju-controller-uuid";

pub const ARCH_NODE_LABEL: &str = "kubernetes.io/arch";

/// Legacy claim/volume names: `juju-<storage>-<ordinal>`.
pub static LEGACY_MOUNT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^juju-(?P<storageName>[0-9a-z-]+?)-[0-9]+$").expect("legacy mount pattern"));
/// Current names with the application prefix stripped: `<storage>[-<unique prefix>]`.
pub static MOUNT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<storageName>[a-z][0-9a-z-]*?)(-[0-9a-f]{8})?$").expect("mount pattern"));

pub fn secret_name(app: &str) -> String { format!("{app}-application-config") }

pub fn headless_service_name(app: &str) -> String { format!("{app}-endpoints") }

pub fn volume_name(app: &str, storage_name: &str) -> String { format!("{app}-{storage_name}") }

pub fn claim_name(volume_name: &str, storage_prefix: &str) -> String { format!("{volume_name}-{storage_prefix}") }

pub fn qualified_storage_class_name(namespace: &str, name: &str) -> String { format!("{namespace}-{name}") }

pub fn labels_for_app(app: &str, legacy: bool) -> Labels {
    if legacy {
        return Labels::from([(LEGACY_LABEL_APP.to_string(), app.to_string())]);
    }
    Labels::from([
        (LABEL_APP.to_string(), app.to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string()),
    ])
}

/// Subset of `labels_for_app` used to match pods.
pub fn selector_labels_for_app(app: &str, legacy: bool) -> Labels {
    let key = if legacy { LEGACY_LABEL_APP } else { LABEL_APP };
    Labels::from([(key.to_string(), app.to_string())])
}

pub fn labels_for_storage(storage_name: &str, legacy: bool) -> Labels {
    let key = if legacy { LEGACY_LABEL_STORAGE } else { LABEL_STORAGE };
    Labels::from([(key.to_string(), storage_name.to_string())])
}

pub fn labels_for_model(model: &str, legacy: bool) -> Labels {
    let key = if legacy { LEGACY_LABEL_MODEL } else { LABEL_MODEL };
    Labels::from([(key.to_string(), model.to_string())])
}

pub fn labels_managed_by() -> Labels { Labels::from([(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string())]) }

pub fn annotations_for_version(version: &str, legacy: bool) -> Labels {
    let key = if legacy { LEGACY_ANNOTATION_VERSION } else { ANNOTATION_VERSION };
    Labels::from([(key.to_string(), version.to_string())])
}

pub fn annotations_for_storage(storage_name: &str, legacy: bool) -> Labels { labels_for_storage(storage_name, legacy) }

pub fn resource_tags_to_annotations(tags: &BTreeMap<String, String>, legacy: bool) -> Labels {
    tags.iter()
        .map(|(k, v)| {
            let key = match (k.as_str(), legacy) {
                (TAG_MODEL_UUID, false) => ANNOTATION_MODEL_ID,
                (TAG_MODEL_UUID, true) => LEGACY_ANNOTATION_MODEL_ID,
                (TAG_CONTROLLER_UUID, false) => ANNOTATION_CONTROLLER_ID,
                (TAG_CONTROLLER_UUID, true) => LEGACY_ANNOTATION_CONTROLLER_ID,
                (other, _) => other,
            };
            (key.to_string(), v.clone())
        })
        .collect()
}

/// Render labels as a `k=v,k=v` selector; BTreeMap order keeps it stable.
pub fn to_selector(labels: &Labels) -> String {
    labels.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",")
}

pub fn field_selector(name: &str, namespace: &str) -> String {
    format!("metadata.name={name},metadata.namespace={namespace}")
}

/// Read the storage-unique prefix off workload annotations, current key first.
pub fn storage_prefix_from_annotations(annotations: Option<&Labels>) -> Option<String> {
    let annotations = annotations?;
    [ANNOTATION_STORAGE_PREFIX, LEGACY_ANNOTATION_STORAGE_PREFIX]
        .iter()
        .filter_map(|k| annotations.get(*k))
        .find(|v| !v.is_empty())
        .cloned()
}

/// Recover the storage name embedded in a volume-mount name.
pub fn storage_name_from_mount(app: &str, mount_name: &str) -> Option<String> {
    if let Some(c) = LEGACY_MOUNT_NAME.captures(mount_name) {
        return Some(c["storageName"].to_string());
    }
    let trimmed = mount_name.strip_prefix(&format!("{app}-"))?;
    MOUNT_NAME.captures(trimmed).map(|c| c["storageName"].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_contract() {
        assert_eq!(secret_name("db"), "db-application-config");
        assert_eq!(headless_service_name("db"), "db-endpoints");
        assert_eq!(claim_name(&volume_name("db", "data"), "1a2b3c4d"), "db-data-1a2b3c4d");
        assert_eq!(qualified_storage_class_name("models", "fast"), "models-fast");
    }

    #[test]
    fn legacy_and_current_labels() {
        assert_eq!(to_selector(&selector_labels_for_app("db", true)), "juju-app=db");
        assert_eq!(to_selector(&labels_for_app("db", false)), "app.kubernetes.io/managed-by=juju,app.kubernetes.io/name=db");
        assert_eq!(to_selector(&selector_labels_for_app("db", false)), "app.kubernetes.io/name=db");
    }

    #[test]
    fn tags_map_to_annotation_keys() {
        let tags = BTreeMap::from([
            (TAG_MODEL_UUID.to_string(), "m-1".to_string()),
            ("team".to_string(), "infra".to_string()),
        ]);
        let current = resource_tags_to_annotations(&tags, false);
        assert_eq!(current.get(ANNOTATION_MODEL_ID).map(String::as_str), Some("m-1"));
        assert_eq!(current.get("team").map(String::as_str), Some("infra"));
        let legacy = resource_tags_to_annotations(&tags, true);
        assert_eq!(legacy.get(LEGACY_ANNOTATION_MODEL_ID).map(String::as_str), Some("m-1"));
    }

    #[test]
    fn storage_names_recovered_from_mounts() {
        assert_eq!(storage_name_from_mount("db", "juju-data-0").as_deref(), Some("data"));
        assert_eq!(storage_name_from_mount("db", "juju-shared-logs-12").as_deref(), Some("shared-logs"));
        assert_eq!(storage_name_from_mount("db", "db-data-1a2b3c4d").as_deref(), Some("data"));
        assert_eq!(storage_name_from_mount("db", "db-cache").as_deref(), Some("cache"));
        assert_eq!(storage_name_from_mount("db", "other-volume"), None);
        assert_eq!(storage_name_from_mount("db", "db-Bad_Name"), None);
    }

    #[test]
    fn prefix_annotation_prefers_current_key() {
        let both = Labels::from([
            (LEGACY_ANNOTATION_STORAGE_PREFIX.to_string(), "00000000".to_string()),
            (ANNOTATION_STORAGE_PREFIX.to_string(), "abcdef12".to_string()),
        ]);
        assert_eq!(storage_prefix_from_annotations(Some(&both)).as_deref(), Some("abcdef12"));
        let legacy = Labels::from([(LEGACY_ANNOTATION_STORAGE_PREFIX.to_string(), "00000000".to_string())]);
        assert_eq!(storage_prefix_from_annotations(Some(&legacy)).as_deref(), Some("00000000"));
        assert_eq!(storage_prefix_from_annotations(None), None);
    }
}
