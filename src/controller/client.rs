//! Access to the cluster API for the reconcilers.
//!
//! Everything a pass reads or writes goes through [`ClusterClient`], so the
//! component state machines can be driven by a mock or an in-memory cluster in
//! tests. The set of kinds the operator manages is closed: [`ObjectKind`]
//! carries their group/version/kind at compile time and [`ManagedObject`]
//! holds one typed object of any of them.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment},
    core::v1::{ConfigMap, Secret, Service, ServiceAccount},
    policy::v1::PodDisruptionBudget,
    rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding},
};
use kube::{
    api::{Api, DeleteParams, ObjectMeta, PostParams},
    runtime::events::{Event as KubeEvent, EventType, Recorder, Reporter},
    Client, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::datadog_agent::DatadogAgent;
use crate::crd::extended_daemonset::ExtendedDaemonSet;
use crate::error::{Error, Result};

use super::helpers::{kube_object_ref, FIELD_MANAGER};

// ── Kind registry ─────────────────────────────────────────────────────────────

/// Group/version/kind of a managed kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KindInfo {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub cluster_scoped: bool,
}

impl KindInfo {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// A typed object the operator manages.
pub trait Managed: Clone + Send + Sync + Sized + 'static {
    const KIND: ObjectKind;
    fn into_managed(self) -> ManagedObject;
    fn from_managed(obj: ManagedObject) -> Option<Self>;
}

macro_rules! managed_kinds {
    (@scoped namespaced) => { false };
    (@scoped cluster) => { true };
    ($($variant:ident($ty:ty) => $group:literal / $version:literal, $scope:ident;)*) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum ObjectKind {
            $($variant,)*
        }

        impl ObjectKind {
            pub const ALL: &'static [ObjectKind] = &[$(ObjectKind::$variant,)*];

            pub const fn info(self) -> KindInfo {
                match self {
                    $(ObjectKind::$variant => KindInfo {
                        group: $group,
                        version: $version,
                        kind: stringify!($variant),
                        cluster_scoped: managed_kinds!(@scoped $scope),
                    },)*
                }
            }
        }

        #[derive(Clone, Debug, PartialEq)]
        pub enum ManagedObject {
            $($variant($ty),)*
        }

        impl ManagedObject {
            pub fn kind(&self) -> ObjectKind {
                match self {
                    $(Self::$variant(_) => ObjectKind::$variant,)*
                }
            }

            pub fn meta(&self) -> &ObjectMeta {
                match self {
                    $(Self::$variant(o) => &o.metadata,)*
                }
            }

            pub fn meta_mut(&mut self) -> &mut ObjectMeta {
                match self {
                    $(Self::$variant(o) => &mut o.metadata,)*
                }
            }
        }

        $(
            impl Managed for $ty {
                const KIND: ObjectKind = ObjectKind::$variant;

                fn into_managed(self) -> ManagedObject {
                    ManagedObject::$variant(self)
                }

                fn from_managed(obj: ManagedObject) -> Option<Self> {
                    match obj {
                        ManagedObject::$variant(o) => Some(o),
                        _ => None,
                    }
                }
            }

            impl From<$ty> for ManagedObject {
                fn from(obj: $ty) -> Self {
                    ManagedObject::$variant(obj)
                }
            }
        )*
    };
}

managed_kinds! {
    DaemonSet(DaemonSet) => "apps" / "v1", namespaced;
    ExtendedDaemonSet(ExtendedDaemonSet) => "datadoghq.com" / "v1alpha1", namespaced;
    Deployment(Deployment) => "apps" / "v1", namespaced;
    Service(Service) => "" / "v1", namespaced;
    Secret(Secret) => "" / "v1", namespaced;
    ConfigMap(ConfigMap) => "" / "v1", namespaced;
    ServiceAccount(ServiceAccount) => "" / "v1", namespaced;
    PodDisruptionBudget(PodDisruptionBudget) => "policy" / "v1", namespaced;
    Role(Role) => "rbac.authorization.k8s.io" / "v1", namespaced;
    RoleBinding(RoleBinding) => "rbac.authorization.k8s.io" / "v1", namespaced;
    ClusterRole(ClusterRole) => "rbac.authorization.k8s.io" / "v1", cluster;
    ClusterRoleBinding(ClusterRoleBinding) => "rbac.authorization.k8s.io" / "v1", cluster;
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.info().kind)
    }
}

impl ManagedObject {
    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventAction {
    Created,
    Updated,
    Deleted,
}

impl EventAction {
    fn verb(self) -> &'static str {
        match self {
            Self::Created => "Create",
            Self::Updated => "Update",
            Self::Deleted => "Delete",
        }
    }
}

impl std::fmt::Display for EventAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "Created",
            Self::Updated => "Updated",
            Self::Deleted => "Deleted",
        };
        f.write_str(s)
    }
}

/// One audit-trail entry attached to the DatadogAgent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventInfo {
    pub action: EventAction,
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
}

impl EventInfo {
    pub fn new(action: EventAction, kind: ObjectKind, namespace: &str, name: &str) -> Self {
        Self {
            action,
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn for_object(action: EventAction, obj: &ManagedObject) -> Self {
        Self::new(action, obj.kind(), obj.namespace(), obj.name())
    }

    pub fn reason(&self) -> String {
        format!("{} {}", self.action, self.kind)
    }

    pub fn note(&self) -> String {
        if self.namespace.is_empty() {
            format!("{} {}", self.kind, self.name)
        } else {
            format!("{} {}/{}", self.kind, self.namespace, self.name)
        }
    }
}

// ── Client trait ──────────────────────────────────────────────────────────────

/// Cluster API verbs used by a reconcile pass.
///
/// `ns` is ignored for cluster-scoped kinds.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch a DatadogAgent, `None` when it does not exist.
    async fn get_agent(&self, ns: &str, name: &str) -> Result<Option<DatadogAgent>>;

    /// Replace metadata and spec (defaults, finalizers).
    async fn update_agent(&self, dda: &DatadogAgent) -> Result<DatadogAgent>;

    /// Replace the status sub-resource. Stale resource versions yield [`Error::Conflict`].
    async fn update_agent_status(&self, dda: &DatadogAgent) -> Result<DatadogAgent>;

    /// Fetch a managed object, `None` when it does not exist.
    async fn get(&self, kind: ObjectKind, ns: &str, name: &str) -> Result<Option<ManagedObject>>;

    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject>;

    async fn update(&self, obj: &ManagedObject) -> Result<ManagedObject>;

    /// Delete a managed object. Deleting a missing object succeeds.
    async fn delete(&self, kind: ObjectKind, ns: &str, name: &str) -> Result<()>;

    /// Record an event against `dda`. Failures are logged, never returned.
    async fn publish_event(&self, dda: &DatadogAgent, event: EventInfo);
}

/// Typed [`ClusterClient::get`].
pub async fn get_as<T: Managed>(
    client: &dyn ClusterClient,
    ns: &str,
    name: &str,
) -> Result<Option<T>> {
    match client.get(T::KIND, ns, name).await? {
        None => Ok(None),
        Some(obj) => T::from_managed(obj).map(Some).ok_or_else(|| {
            Error::reconcile(format!("unexpected kind returned for {} {ns}/{name}", T::KIND))
        }),
    }
}

/// Typed [`ClusterClient::create`].
pub async fn create_as<T: Managed>(client: &dyn ClusterClient, obj: T) -> Result<T> {
    let created = client.create(&obj.into_managed()).await?;
    T::from_managed(created)
        .ok_or_else(|| Error::reconcile(format!("unexpected kind returned for new {}", T::KIND)))
}

/// Typed [`ClusterClient::update`].
pub async fn update_as<T: Managed>(client: &dyn ClusterClient, obj: T) -> Result<T> {
    let updated = client.update(&obj.into_managed()).await?;
    T::from_managed(updated)
        .ok_or_else(|| Error::reconcile(format!("unexpected kind returned for {}", T::KIND)))
}

// ── kube-rs implementation ────────────────────────────────────────────────────

/// [`ClusterClient`] backed by a live API server.
pub struct KubeClusterClient {
    client: Client,
    reporter: Reporter,
}

impl KubeClusterClient {
    pub fn new(client: Client, reporter: Reporter) -> Self {
        Self { client, reporter }
    }

    fn agents(&self, ns: &str) -> Api<DatadogAgent> {
        Api::namespaced(self.client.clone(), ns)
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

async fn fetch<T>(api: Api<T>, name: &str) -> Result<Option<ManagedObject>>
where
    T: Managed + kube::Resource + DeserializeOwned + Debug,
{
    let found = api.get_opt(name).await.map_err(Error::from_api)?;
    Ok(found.map(T::into_managed))
}

async fn post<T>(api: Api<T>, obj: &T) -> Result<ManagedObject>
where
    T: Managed + kube::Resource + Serialize + DeserializeOwned + Debug,
{
    let created = api
        .create(&post_params(), obj)
        .await
        .map_err(Error::from_api)?;
    Ok(created.into_managed())
}

async fn replace<T>(api: Api<T>, obj: &T) -> Result<ManagedObject>
where
    T: Managed + kube::Resource + Serialize + DeserializeOwned + Debug,
{
    let name = obj.meta().name.clone().unwrap_or_default();
    let updated = api
        .replace(&name, &post_params(), obj)
        .await
        .map_err(Error::from_api)?;
    Ok(updated.into_managed())
}

async fn remove<T>(api: Api<T>, name: &str) -> Result<()>
where
    T: Managed + kube::Resource + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ref e)) if e.code == 404 => {
            debug!(%name, "object already gone");
            Ok(())
        }
        Err(e) => Err(Error::from_api(e)),
    }
}

/// Run a generic verb with the right `Api` for a kind.
macro_rules! with_kind_api {
    ($kind:expr, $client:expr, $ns:expr, $verb:ident($($arg:expr),*)) => {
        match $kind {
            ObjectKind::DaemonSet => $verb(Api::<DaemonSet>::namespaced($client, $ns), $($arg),*).await,
            ObjectKind::ExtendedDaemonSet => $verb(Api::<ExtendedDaemonSet>::namespaced($client, $ns), $($arg),*).await,
            ObjectKind::Deployment => $verb(Api::<Deployment>::namespaced($client, $ns), $($arg),*).await,
            ObjectKind::Service => $verb(Api::<Service>::namespaced($client, $ns), $($arg),*).await,
            ObjectKind::Secret => $verb(Api::<Secret>::namespaced($client, $ns), $($arg),*).await,
            ObjectKind::ConfigMap => $verb(Api::<ConfigMap>::namespaced($client, $ns), $($arg),*).await,
            ObjectKind::ServiceAccount => $verb(Api::<ServiceAccount>::namespaced($client, $ns), $($arg),*).await,
            ObjectKind::PodDisruptionBudget => $verb(Api::<PodDisruptionBudget>::namespaced($client, $ns), $($arg),*).await,
            ObjectKind::Role => $verb(Api::<Role>::namespaced($client, $ns), $($arg),*).await,
            ObjectKind::RoleBinding => $verb(Api::<RoleBinding>::namespaced($client, $ns), $($arg),*).await,
            ObjectKind::ClusterRole => $verb(Api::<ClusterRole>::all($client), $($arg),*).await,
            ObjectKind::ClusterRoleBinding => $verb(Api::<ClusterRoleBinding>::all($client), $($arg),*).await,
        }
    };
}

/// Run a generic verb on the typed object inside a [`ManagedObject`].
macro_rules! with_object_api {
    ($obj:expr, $client:expr, $ns:expr, $verb:ident) => {
        match $obj {
            ManagedObject::DaemonSet(o) => $verb(Api::namespaced($client, $ns), o).await,
            ManagedObject::ExtendedDaemonSet(o) => $verb(Api::namespaced($client, $ns), o).await,
            ManagedObject::Deployment(o) => $verb(Api::namespaced($client, $ns), o).await,
            ManagedObject::Service(o) => $verb(Api::namespaced($client, $ns), o).await,
            ManagedObject::Secret(o) => $verb(Api::namespaced($client, $ns), o).await,
            ManagedObject::ConfigMap(o) => $verb(Api::namespaced($client, $ns), o).await,
            ManagedObject::ServiceAccount(o) => $verb(Api::namespaced($client, $ns), o).await,
            ManagedObject::PodDisruptionBudget(o) => $verb(Api::namespaced($client, $ns), o).await,
            ManagedObject::Role(o) => $verb(Api::namespaced($client, $ns), o).await,
            ManagedObject::RoleBinding(o) => $verb(Api::namespaced($client, $ns), o).await,
            ManagedObject::ClusterRole(o) => $verb(Api::all($client), o).await,
            ManagedObject::ClusterRoleBinding(o) => $verb(Api::all($client), o).await,
        }
    };
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_agent(&self, ns: &str, name: &str) -> Result<Option<DatadogAgent>> {
        Ok(self.agents(ns).get_opt(name).await?)
    }

    async fn update_agent(&self, dda: &DatadogAgent) -> Result<DatadogAgent> {
        let ns = dda.namespace().unwrap_or_default();
        self.agents(&ns)
            .replace(&dda.name_any(), &post_params(), dda)
            .await
            .map_err(Error::from_api)
    }

    async fn update_agent_status(&self, dda: &DatadogAgent) -> Result<DatadogAgent> {
        let ns = dda.namespace().unwrap_or_default();
        let data = serde_json::to_vec(dda)?;
        self.agents(&ns)
            .replace_status(&dda.name_any(), &post_params(), data)
            .await
            .map_err(Error::from_api)
    }

    async fn get(&self, kind: ObjectKind, ns: &str, name: &str) -> Result<Option<ManagedObject>> {
        with_kind_api!(kind, self.client.clone(), ns, fetch(name))
    }

    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject> {
        let ns = obj.namespace().to_string();
        with_object_api!(obj, self.client.clone(), &ns, post)
    }

    async fn update(&self, obj: &ManagedObject) -> Result<ManagedObject> {
        let ns = obj.namespace().to_string();
        with_object_api!(obj, self.client.clone(), &ns, replace)
    }

    async fn delete(&self, kind: ObjectKind, ns: &str, name: &str) -> Result<()> {
        with_kind_api!(kind, self.client.clone(), ns, remove(name))
    }

    async fn publish_event(&self, dda: &DatadogAgent, event: EventInfo) {
        let rec = Recorder::new(self.client.clone(), self.reporter.clone());
        let oref = kube_object_ref(dda);
        if let Err(e) = rec
            .publish(
                &KubeEvent {
                    type_: EventType::Normal,
                    reason: event.reason(),
                    note: Some(event.note()),
                    action: event.action.verb().to_string(),
                    secondary: None,
                },
                &oref,
            )
            .await
        {
            warn!(%e, "failed to publish event");
        }
    }
}
