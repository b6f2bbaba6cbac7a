//! DatadogAgent controller: one pass per resource.
//!
//! A pass fetches the resource, handles deletion, makes sure the finalizer and
//! the defaults are persisted, then runs the component reconcilers in a fixed
//! order (cluster agent, cluster checks runner, node agent). The first one that
//! asks for a requeue or fails ends the pass. Status is published last, also
//! after a failure, so errors show up in the conditions.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment},
    core::v1::{ConfigMap, Secret, Service, ServiceAccount},
    policy::v1::PodDisruptionBudget,
    rbac::v1::{Role, RoleBinding},
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::Api,
    runtime::{controller::Action, watcher::Config as WatcherConfig, Controller},
    Client, ResourceExt,
};
use tracing::{debug, info, warn};

use crate::crd::datadog_agent::{DatadogAgent, DatadogAgentStatus};
use crate::crd::extended_daemonset::ExtendedDaemonSet;
use crate::error::{Error, Result};
use crate::helpers::{Component, OperatorDefaults, ReconcilerOptions, TokenGenerator};

use super::client::ClusterClient;
use super::defaults::apply_defaults;
use super::status::fold_conditions;
use super::{agent, cluster_agent, cluster_checks_runner, dependencies, Requeue};

pub const FINALIZER: &str = "finalizer.agent.datadoghq.com";

/// Delay after losing an optimistic-concurrency race.
pub const CONFLICT_DELAY: Duration = Duration::from_secs(1);
/// Delay while a dependent workload has no available replica.
pub const NOT_READY_DELAY: Duration = Duration::from_secs(15);

/// Shared state handed to every reconcile call.
pub struct Context {
    pub client: Arc<dyn ClusterClient>,
    pub defaults: OperatorDefaults,
    pub options: ReconcilerOptions,
    pub tokens: Arc<dyn TokenGenerator>,
}

// ── Controller entry point ────────────────────────────────────────────────────

/// Start the DatadogAgent controller. Returns a future that runs forever.
pub async fn run(client: Client, ctx: Arc<Context>, watch_namespace: Option<String>) {
    fn api<K>(client: &Client, ns: Option<&str>) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        match ns {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        }
    }

    let ns = watch_namespace.as_deref();
    let agents: Api<DatadogAgent> = api(&client, ns);

    let mut controller = Controller::new(agents, WatcherConfig::default())
        .owns(api::<DaemonSet>(&client, ns), WatcherConfig::default())
        .owns(api::<Deployment>(&client, ns), WatcherConfig::default())
        .owns(api::<Service>(&client, ns), WatcherConfig::default())
        .owns(api::<Secret>(&client, ns), WatcherConfig::default())
        .owns(api::<ConfigMap>(&client, ns), WatcherConfig::default())
        .owns(api::<ServiceAccount>(&client, ns), WatcherConfig::default())
        .owns(api::<Role>(&client, ns), WatcherConfig::default())
        .owns(api::<RoleBinding>(&client, ns), WatcherConfig::default())
        .owns(
            api::<PodDisruptionBudget>(&client, ns),
            WatcherConfig::default(),
        );
    if ctx.options.support_extended_daemonset {
        controller = controller.owns(
            api::<ExtendedDaemonSet>(&client, ns),
            WatcherConfig::default(),
        );
    }

    controller
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(name = %obj.name, ?action, "reconciled"),
                Err(e) => warn!("reconcile failed: {e:?}"),
            }
        })
        .await;
}

async fn reconcile(dda: Arc<DatadogAgent>, ctx: Arc<Context>) -> Result<Action> {
    let ns = dda.namespace().unwrap_or_default();
    reconcile_key(&ctx, &ns, &dda.name_any()).await
}

fn error_policy(dda: Arc<DatadogAgent>, error: &Error, ctx: Arc<Context>) -> Action {
    let period = ctx.options.requeue_period;
    warn!(name = %dda.name_any(), %error, "reconcile error, requeuing in {}s", period.as_secs());
    Action::requeue(period)
}

// ── Reconcile ─────────────────────────────────────────────────────────────────

/// Run one pass for the DatadogAgent `ns/name`.
pub async fn reconcile_key(ctx: &Context, ns: &str, name: &str) -> Result<Action> {
    let client = ctx.client.as_ref();
    let Some(mut dda) = client.get_agent(ns, name).await? else {
        debug!(%ns, %name, "DatadogAgent not found, assuming deleted");
        return Ok(Action::await_change());
    };

    if dda.metadata.deletion_timestamp.is_some() {
        return finalize(client, dda).await;
    }

    if !has_finalizer(&dda) {
        dda.finalizers_mut().push(FINALIZER.to_string());
        return persist(client, &dda, "added finalizer").await;
    }

    if apply_defaults(&mut dda.spec, &ctx.defaults) {
        return persist(client, &dda, "spec defaults applied from operator configuration").await;
    }

    let mut status = dda.status.clone().unwrap_or_default();
    let outcome = run_components(ctx, &dda, &mut status).await;

    let now = Time(Utc::now());
    let (action, failure) = match outcome {
        Ok(requeue) => {
            fold_conditions(&mut status, None, &now);
            (requeue.into_action(ctx.options.requeue_period), None)
        }
        Err(e) if e.is_conflict() => {
            debug!(%ns, %name, %e, "write conflict, retrying shortly");
            return Ok(Action::requeue(CONFLICT_DELAY));
        }
        Err(e) if e.is_not_ready() => {
            info!(%ns, %name, %e, "waiting for dependent workload");
            fold_conditions(&mut status, Some(&e.to_string()), &now);
            (Action::requeue(NOT_READY_DELAY), None)
        }
        Err(e) => {
            fold_conditions(&mut status, Some(&e.to_string()), &now);
            (Action::requeue(ctx.options.requeue_period), Some(e))
        }
    };

    if let Err(e) = publish_status(client, &dda, status).await {
        if e.is_conflict() {
            debug!(%ns, %name, "status conflict, retrying shortly");
            return Ok(Action::requeue(CONFLICT_DELAY));
        }
        warn!(%ns, %name, %e, "failed to update status");
        return Err(failure.unwrap_or(e));
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(action),
    }
}

async fn run_components(
    ctx: &Context,
    dda: &DatadogAgent,
    status: &mut DatadogAgentStatus,
) -> Result<Requeue> {
    let client = ctx.client.as_ref();

    let requeue = cluster_agent::reconcile(client, dda, ctx.tokens.as_ref(), status).await?;
    if requeue.is_requested() {
        return Ok(requeue);
    }
    let requeue = cluster_checks_runner::reconcile(client, dda, status).await?;
    if requeue.is_requested() {
        return Ok(requeue);
    }
    agent::reconcile(client, dda, &ctx.options, status).await
}

fn has_finalizer(dda: &DatadogAgent) -> bool {
    dda.finalizers().iter().any(|f| f == FINALIZER)
}

/// Write metadata or spec changes and requeue right away.
async fn persist(client: &dyn ClusterClient, dda: &DatadogAgent, what: &str) -> Result<Action> {
    match client.update_agent(dda).await {
        Ok(_) => {
            info!(name = %dda.name_any(), "{what}");
            Ok(Action::requeue(Duration::ZERO))
        }
        Err(e) if e.is_conflict() => Ok(Action::requeue(CONFLICT_DELAY)),
        Err(e) => Err(e),
    }
}

/// Write the status sub-resource when it differs from the stored one.
async fn publish_status(
    client: &dyn ClusterClient,
    dda: &DatadogAgent,
    status: DatadogAgentStatus,
) -> Result<()> {
    if dda.status.as_ref() == Some(&status) {
        return Ok(());
    }
    let mut updated = dda.clone();
    updated.status = Some(status);
    client.update_agent_status(&updated).await?;
    Ok(())
}

// ── Cleanup (finalizer) ──────────────────────────────────────────────────────

/// Remove cluster-scoped objects, which owner references cannot garbage
/// collect, then release the finalizer.
async fn finalize(client: &dyn ClusterClient, mut dda: DatadogAgent) -> Result<Action> {
    if !has_finalizer(&dda) {
        return Ok(Action::await_change());
    }
    for component in [
        Component::ClusterAgent,
        Component::ClusterChecksRunner,
        Component::Agent,
    ] {
        dependencies::cleanup_cluster_rbac(client, &dda, component).await?;
    }
    dda.finalizers_mut().retain(|f| f != FINALIZER);
    match client.update_agent(&dda).await {
        Ok(_) => {
            info!(name = %dda.name_any(), "finalizer removed");
            Ok(Action::await_change())
        }
        Err(e) if e.is_conflict() => Ok(Action::requeue(CONFLICT_DELAY)),
        Err(e) => Err(e),
    }
}
