//! Cluster checks runner reconciler.

use kube::ResourceExt;

use crate::crd::datadog_agent::{DatadogAgent, DatadogAgentStatus};
use crate::error::Result;
use crate::helpers::{cluster_checks_runner_deployment_name, Component};

use super::builders::{self, cluster_checks_runner_enabled};
use super::client::{ClusterClient, ObjectKind};
use super::cluster_agent::{check_rename, converge_deployment};
use super::dependencies;
use super::Requeue;

pub async fn reconcile(
    client: &dyn ClusterClient,
    dda: &DatadogAgent,
    status: &mut DatadogAgentStatus,
) -> Result<Requeue> {
    let name = cluster_checks_runner_deployment_name(dda);
    let enabled = cluster_checks_runner_enabled(dda);
    if enabled {
        check_rename(
            status.cluster_checks_runner.as_ref(),
            &name,
            "cluster checks runner",
        )?;
    }

    let requeue = dependencies::custom_config(client, dda, Component::ClusterChecksRunner).await?;
    if requeue.is_requested() {
        return Ok(requeue);
    }
    let requeue = dependencies::rbac(client, dda, Component::ClusterChecksRunner).await?;
    if requeue.is_requested() {
        return Ok(requeue);
    }
    let requeue =
        dependencies::pod_disruption_budget(client, dda, Component::ClusterChecksRunner, enabled)
            .await?;
    if requeue.is_requested() {
        return Ok(requeue);
    }

    if !enabled {
        let ns = dda.namespace().unwrap_or_default();
        dependencies::cleanup(client, dda, ObjectKind::Deployment, &ns, &name).await?;
        status.cluster_checks_runner = None;
        return Ok(Requeue::No);
    }

    let converged = converge_deployment(
        client,
        dda,
        &name,
        |selector| builders::cluster_checks_runner_deployment(dda, selector),
        &mut status.cluster_checks_runner,
    )
    .await?;
    Ok(converged.requeue)
}
