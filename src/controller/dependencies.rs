//! Dependency managers.
//!
//! Every dependency follows the same shape: clean up when not needed, create
//! when missing, update when the digest (or, for RBAC, the content) differs.
//! Any mutation publishes an event and asks the loop to requeue so the next
//! pass reads the persisted object back.

use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment},
    core::v1::{ConfigMap, Secret, Service, ServiceAccount},
    policy::v1::PodDisruptionBudget,
    rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding},
};
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::crd::datadog_agent::DatadogAgent;
use crate::crd::extended_daemonset::ExtendedDaemonSet;
use crate::error::Result;
use crate::helpers::{
    cluster_agent_service_name, credentials_secret_name, custom_config_map,
    metrics_server_service_name, pdb_name, rbac_resources_name, service_account_name, Component,
};

use super::builders::{self, Built};
use super::client::{
    create_as, get_as, update_as, ClusterClient, EventAction, EventInfo, Managed, ObjectKind,
};
use super::hash;
use super::helpers::{is_owned_by, merge_meta};
use super::Requeue;

// ── Generic object reconciliation ─────────────────────────────────────────────

/// A managed kind that can be written back after an edit.
pub trait Reconcilable: Managed + Resource<DynamicType = ()> {
    /// Copy fields the API server assigns and refuses to change.
    fn keep_server_fields(&mut self, _live: &Self) {}
}

impl Reconcilable for DaemonSet {}
impl Reconcilable for ExtendedDaemonSet {}
impl Reconcilable for Deployment {}
impl Reconcilable for Secret {}
impl Reconcilable for ConfigMap {}
impl Reconcilable for PodDisruptionBudget {}
impl Reconcilable for ServiceAccount {}
impl Reconcilable for ClusterRole {}
impl Reconcilable for ClusterRoleBinding {}
impl Reconcilable for Role {}
impl Reconcilable for RoleBinding {}

impl Reconcilable for Service {
    fn keep_server_fields(&mut self, live: &Self) {
        let live_spec = live.spec.as_ref();
        if let Some(spec) = self.spec.as_mut() {
            spec.cluster_ip = live_spec.and_then(|s| s.cluster_ip.clone());
            spec.cluster_ips = live_spec.and_then(|s| s.cluster_ips.clone());
            if spec.ip_families.is_none() {
                spec.ip_families = live_spec.and_then(|s| s.ip_families.clone());
            }
            if spec.ip_family_policy.is_none() {
                spec.ip_family_policy = live_spec.and_then(|s| s.ip_family_policy.clone());
            }
        }
    }
}

/// Desired object carrying the live object's identity and server fields,
/// ready for an update call.
pub fn prepare_update<T: Reconcilable>(desired: &T, live: &T) -> T {
    let mut obj = desired.clone();
    let mut meta = live.meta().clone();
    merge_meta(&mut meta, desired.meta());
    if desired.meta().owner_references.is_some() {
        meta.owner_references = desired.meta().owner_references.clone();
    }
    *obj.meta_mut() = meta;
    obj.keep_server_fields(live);
    obj
}

fn location<T: Resource>(obj: &T) -> (String, String) {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

pub(crate) async fn record(
    client: &dyn ClusterClient,
    dda: &DatadogAgent,
    action: EventAction,
    kind: ObjectKind,
    ns: &str,
    name: &str,
) {
    info!(%kind, namespace = %ns, %name, "{}", action);
    client
        .publish_event(dda, EventInfo::new(action, kind, ns, name))
        .await;
}

/// Create or update a hash-stamped object.
pub async fn ensure<T: Reconcilable>(
    client: &dyn ClusterClient,
    dda: &DatadogAgent,
    desired: Built<T>,
) -> Result<Requeue> {
    let (ns, name) = location(&desired.object);
    match get_as::<T>(client, &ns, &name).await? {
        None => {
            create_as(client, desired.object).await?;
            record(client, dda, EventAction::Created, T::KIND, &ns, &name).await;
            Ok(Requeue::Now)
        }
        Some(live) if hash::matches(&desired.digest, live.meta()) => {
            debug!(kind = %T::KIND, namespace = %ns, %name, "up to date");
            Ok(Requeue::No)
        }
        Some(live) => {
            update_as(client, prepare_update(&desired.object, &live)).await?;
            record(client, dda, EventAction::Updated, T::KIND, &ns, &name).await;
            Ok(Requeue::Now)
        }
    }
}

/// Delete an object the operator owns. Missing or foreign objects are left alone.
pub async fn cleanup(
    client: &dyn ClusterClient,
    dda: &DatadogAgent,
    kind: ObjectKind,
    ns: &str,
    name: &str,
) -> Result<Requeue> {
    let Some(live) = client.get(kind, ns, name).await? else {
        return Ok(Requeue::No);
    };
    if !is_owned_by(live.meta(), dda) {
        debug!(%kind, namespace = %ns, %name, "not owned, skipping cleanup");
        return Ok(Requeue::No);
    }
    client.delete(kind, ns, name).await?;
    record(client, dda, EventAction::Deleted, kind, ns, name).await;
    Ok(Requeue::No)
}

// ── Structural comparison (RBAC) ──────────────────────────────────────────────

/// Kinds compared by content instead of a digest.
pub trait StructuralCompare: Reconcilable {
    fn same_content(&self, live: &Self) -> bool;

    /// The difference touches a field the API server will not update.
    fn needs_recreate(&self, _live: &Self) -> bool {
        false
    }
}

/// Only the operator's labels and owner references are compared. Token
/// secrets and other fields are left to the API server.
impl StructuralCompare for ServiceAccount {
    fn same_content(&self, live: &Self) -> bool {
        let live_labels = live.labels();
        let labels_kept = self
            .labels()
            .iter()
            .all(|(k, v)| live_labels.get(k) == Some(v));
        labels_kept && self.metadata.owner_references == live.metadata.owner_references
    }
}

impl StructuralCompare for ClusterRole {
    fn same_content(&self, live: &Self) -> bool {
        self.rules == live.rules
    }
}

impl StructuralCompare for Role {
    fn same_content(&self, live: &Self) -> bool {
        self.rules == live.rules
    }
}

impl StructuralCompare for ClusterRoleBinding {
    fn same_content(&self, live: &Self) -> bool {
        self.role_ref == live.role_ref && self.subjects == live.subjects
    }

    fn needs_recreate(&self, live: &Self) -> bool {
        self.role_ref != live.role_ref
    }
}

impl StructuralCompare for RoleBinding {
    fn same_content(&self, live: &Self) -> bool {
        self.role_ref == live.role_ref && self.subjects == live.subjects
    }

    fn needs_recreate(&self, live: &Self) -> bool {
        self.role_ref != live.role_ref
    }
}

pub async fn ensure_structural<T: StructuralCompare>(
    client: &dyn ClusterClient,
    dda: &DatadogAgent,
    desired: T,
) -> Result<Requeue> {
    let (ns, name) = location(&desired);
    match get_as::<T>(client, &ns, &name).await? {
        None => {
            create_as(client, desired).await?;
            record(client, dda, EventAction::Created, T::KIND, &ns, &name).await;
            Ok(Requeue::Now)
        }
        Some(live) if desired.same_content(&live) => Ok(Requeue::No),
        Some(live) if desired.needs_recreate(&live) => {
            client.delete(T::KIND, &ns, &name).await?;
            record(client, dda, EventAction::Deleted, T::KIND, &ns, &name).await;
            create_as(client, desired).await?;
            record(client, dda, EventAction::Created, T::KIND, &ns, &name).await;
            Ok(Requeue::Now)
        }
        Some(live) => {
            update_as(client, prepare_update(&desired, &live)).await?;
            record(client, dda, EventAction::Updated, T::KIND, &ns, &name).await;
            Ok(Requeue::Now)
        }
    }
}

// ── Individual dependencies ───────────────────────────────────────────────────

fn namespace(dda: &DatadogAgent) -> String {
    dda.namespace().unwrap_or_default()
}

pub async fn credentials_secret(client: &dyn ClusterClient, dda: &DatadogAgent) -> Result<Requeue> {
    match builders::credentials_secret(dda)? {
        Some(built) => ensure(client, dda, built).await,
        None => {
            cleanup(
                client,
                dda,
                ObjectKind::Secret,
                &namespace(dda),
                &credentials_secret_name(dda),
            )
            .await
        }
    }
}

pub async fn custom_config(
    client: &dyn ClusterClient,
    dda: &DatadogAgent,
    component: Component,
) -> Result<Requeue> {
    match builders::custom_config_configmap(dda, component)? {
        Some(built) => ensure(client, dda, built).await,
        None => {
            let (name, _) = custom_config_map(dda, component);
            cleanup(client, dda, ObjectKind::ConfigMap, &namespace(dda), &name).await
        }
    }
}

pub async fn cluster_agent_services(client: &dyn ClusterClient, dda: &DatadogAgent) -> Result<Requeue> {
    let ns = namespace(dda);
    let Some(cluster_agent) = dda.spec.cluster_agent.as_ref() else {
        cleanup(client, dda, ObjectKind::Service, &ns, &cluster_agent_service_name(dda)).await?;
        return cleanup(client, dda, ObjectKind::Service, &ns, &metrics_server_service_name(dda)).await;
    };

    let requeue = ensure(client, dda, builders::cluster_agent_service(dda)?).await?;
    if requeue.is_requested() {
        return Ok(requeue);
    }
    if cluster_agent.metrics_provider_enabled() {
        ensure(client, dda, builders::metrics_server_service(dda)?).await
    } else {
        cleanup(client, dda, ObjectKind::Service, &ns, &metrics_server_service_name(dda)).await
    }
}

pub async fn pod_disruption_budget(
    client: &dyn ClusterClient,
    dda: &DatadogAgent,
    component: Component,
    needed: bool,
) -> Result<Requeue> {
    if needed {
        ensure(client, dda, builders::pod_disruption_budget(dda, component)?).await
    } else {
        cleanup(
            client,
            dda,
            ObjectKind::PodDisruptionBudget,
            &namespace(dda),
            &pdb_name(dda, component),
        )
        .await
    }
}

fn rbac_enabled(dda: &DatadogAgent, component: Component) -> bool {
    match component {
        Component::Agent => dda.spec.agent.as_ref().is_some_and(|a| a.rbac.enabled()),
        Component::ClusterAgent => dda
            .spec
            .cluster_agent
            .as_ref()
            .is_some_and(|c| c.rbac.enabled()),
        Component::ClusterChecksRunner => {
            builders::cluster_checks_runner_enabled(dda)
                && dda
                    .spec
                    .cluster_checks_runner
                    .as_ref()
                    .is_some_and(|c| c.rbac.enabled())
        }
    }
}

/// ServiceAccount, ClusterRole and ClusterRoleBinding of a component, plus
/// the leader-election Role and RoleBinding of the cluster agent.
pub async fn rbac(client: &dyn ClusterClient, dda: &DatadogAgent, component: Component) -> Result<Requeue> {
    if !rbac_enabled(dda, component) {
        return cleanup_rbac(client, dda, component).await;
    }

    let requeue = ensure_structural(client, dda, builders::service_account(dda, component)).await?;
    if requeue.is_requested() {
        return Ok(requeue);
    }
    let requeue = ensure_structural(client, dda, builders::cluster_role(dda, component)).await?;
    if requeue.is_requested() {
        return Ok(requeue);
    }
    let requeue =
        ensure_structural(client, dda, builders::cluster_role_binding(dda, component)).await?;
    if requeue.is_requested() || component != Component::ClusterAgent {
        return Ok(requeue);
    }
    let requeue = ensure_structural(client, dda, builders::role(dda, component)).await?;
    if requeue.is_requested() {
        return Ok(requeue);
    }
    ensure_structural(client, dda, builders::role_binding(dda, component)).await
}

/// Delete a component's RBAC bundle.
pub async fn cleanup_rbac(
    client: &dyn ClusterClient,
    dda: &DatadogAgent,
    component: Component,
) -> Result<Requeue> {
    let ns = namespace(dda);
    let name = rbac_resources_name(dda, component);
    cleanup_cluster_rbac(client, dda, component).await?;
    cleanup(client, dda, ObjectKind::RoleBinding, &ns, &name).await?;
    cleanup(client, dda, ObjectKind::Role, &ns, &name).await?;
    cleanup(
        client,
        dda,
        ObjectKind::ServiceAccount,
        &ns,
        &service_account_name(dda, component),
    )
    .await
}

/// Delete a component's ClusterRole and ClusterRoleBinding. Owner references
/// do not cover cluster-scoped objects, so the finalizer calls this too.
pub async fn cleanup_cluster_rbac(
    client: &dyn ClusterClient,
    dda: &DatadogAgent,
    component: Component,
) -> Result<Requeue> {
    let name = rbac_resources_name(dda, component);
    cleanup(client, dda, ObjectKind::ClusterRoleBinding, "", &name).await?;
    cleanup(client, dda, ObjectKind::ClusterRole, "", &name).await
}
