//! Shared helpers for controller modules.
//!
//! Small constructors for Kubernetes API objects reused by the builders and
//! reconcilers. Naming and label schemes live in `crate::helpers` instead.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    EnvVar, EnvVarSource, ObjectFieldSelector, ObjectReference, SecretKeySelector,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::crd::datadog_agent::DatadogAgent;

/// Field manager name recorded on every write.
pub const FIELD_MANAGER: &str = "datadog-operator";

/// Build a controller OwnerReference for any kube-rs `Resource`.
///
/// `K: Resource<DynamicType = ()>` means the group, version and kind are
/// known at compile time, which holds for every type this operator manages.
pub fn controller_owner_ref<K: Resource<DynamicType = ()>>(obj: &K) -> OwnerReference {
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: obj.name_any(),
        uid: obj.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Build an ObjectReference from any kube Resource, for events.
pub fn kube_object_ref<K: Resource<DynamicType = ()>>(obj: &K) -> ObjectReference {
    ObjectReference {
        api_version: Some(K::api_version(&()).to_string()),
        kind: Some(K::kind(&()).to_string()),
        name: Some(obj.name_any()),
        namespace: obj.namespace(),
        uid: obj.meta().uid.clone(),
        resource_version: obj.meta().resource_version.clone(),
        ..Default::default()
    }
}

/// Metadata for a namespaced object owned by `dda`.
pub fn owned_meta(dda: &DatadogAgent, name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: dda.namespace(),
        labels: Some(labels),
        owner_references: Some(vec![controller_owner_ref(dda)]),
        ..Default::default()
    }
}

/// Metadata for a cluster-scoped object. Ownership is carried by labels.
pub fn cluster_meta(name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(labels),
        ..Default::default()
    }
}

/// Keep an existing selector verbatim, or synthesize one from `labels`.
pub fn selector_or_default(
    existing: Option<&LabelSelector>,
    labels: &BTreeMap<String, String>,
) -> LabelSelector {
    existing.cloned().unwrap_or_else(|| LabelSelector {
        match_labels: Some(labels.clone()),
        ..Default::default()
    })
}

/// Add the selector's match labels to `labels` so the pods keep matching.
pub fn merge_selector_labels(labels: &mut BTreeMap<String, String>, selector: &LabelSelector) {
    if let Some(match_labels) = &selector.match_labels {
        labels.extend(match_labels.clone());
    }
}

/// Copy desired labels and annotations over the live ones, keeping keys the
/// operator does not manage.
pub fn merge_meta(live: &mut ObjectMeta, desired: &ObjectMeta) {
    if let Some(labels) = &desired.labels {
        live.labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.clone());
    }
    if let Some(annotations) = &desired.annotations {
        live.annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations.clone());
    }
}

/// Shorthand for a plain-value `EnvVar`.
pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Build an `EnvVar` that reads its value from a Secret key.
pub fn secret_env(env_name: &str, secret_name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: env_name.into(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.into(),
                key: key.into(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build an `EnvVar` from a downward-API field such as `status.hostIP`.
pub fn field_env(env_name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: env_name.into(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.into(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// True when `meta` belongs to `dda`, either through a controller owner
/// reference or, for cluster-scoped objects, the ownership labels.
pub fn is_owned_by(meta: &ObjectMeta, dda: &DatadogAgent) -> bool {
    let uid = dda.meta().uid.as_deref();
    let by_ref = meta
        .owner_references
        .iter()
        .flatten()
        .any(|r| uid == Some(r.uid.as_str()));
    by_ref || crate::helpers::is_owned_by_labels(meta, dda)
}
