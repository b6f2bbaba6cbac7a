//! Cluster agent reconciler.
//!
//! Same found/missing × digest shape as the node agent without the dual-kind
//! branch. Two extras: the shared auth token is generated (and recorded in
//! status) before anything else, and an existing Deployment must have at least
//! one available replica before the pass counts as done.

use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::ResourceExt;
use tracing::info;

use crate::crd::datadog_agent::{DatadogAgent, DatadogAgentStatus, DeploymentStatus};
use crate::error::{Error, Result};
use crate::helpers::{cluster_agent_deployment_name, Component, TokenGenerator};

use super::builders::{self, Built};
use super::client::{create_as, get_as, update_as, ClusterClient, EventAction, Managed, ObjectKind};
use super::dependencies::{self, prepare_update, record};
use super::hash;
use super::status::deployment_status;
use super::Requeue;

/// Outcome of converging one Deployment-backed component.
pub(crate) struct Converged {
    pub requeue: Requeue,
    /// The live Deployment after the pass, unless it was just created.
    pub existing: Option<Deployment>,
}

/// Create or update a component Deployment and refresh its status slot.
pub(crate) async fn converge_deployment<F>(
    client: &dyn ClusterClient,
    dda: &DatadogAgent,
    name: &str,
    build: F,
    slot: &mut Option<DeploymentStatus>,
) -> Result<Converged>
where
    F: Fn(Option<&LabelSelector>) -> Result<Built<Deployment>>,
{
    let ns = dda.namespace().unwrap_or_default();
    let kind = <Deployment as Managed>::KIND;
    match get_as::<Deployment>(client, &ns, name).await? {
        None => {
            let built = build(None)?;
            match create_as(client, built.object).await {
                Ok(created) => {
                    record(client, dda, EventAction::Created, kind, &ns, name).await;
                    *slot = Some(deployment_status(
                        Some(&created),
                        slot.as_ref(),
                        Some(Time(Utc::now())),
                    ));
                    Ok(Converged {
                        requeue: Requeue::No,
                        existing: None,
                    })
                }
                Err(e) => {
                    *slot = Some(deployment_status(None, slot.as_ref(), None));
                    Err(e)
                }
            }
        }
        Some(live) => {
            let built = build(live.spec.as_ref().map(|s| &s.selector))?;
            if hash::matches(&built.digest, &live.metadata) {
                *slot = Some(deployment_status(Some(&live), slot.as_ref(), None));
                return Ok(Converged {
                    requeue: Requeue::No,
                    existing: Some(live),
                });
            }
            let updated = update_as(client, prepare_update(&built.object, &live)).await?;
            record(client, dda, EventAction::Updated, kind, &ns, name).await;
            *slot = Some(deployment_status(
                Some(&updated),
                slot.as_ref(),
                Some(Time(Utc::now())),
            ));
            Ok(Converged {
                requeue: Requeue::No,
                existing: Some(updated),
            })
        }
    }
}

/// Reject a change of a Deployment name already recorded in status.
pub(crate) fn check_rename(slot: Option<&DeploymentStatus>, wanted: &str, what: &str) -> Result<()> {
    match slot.and_then(|s| s.deployment_name.as_deref()) {
        Some(recorded) if !recorded.is_empty() && recorded != wanted => Err(Error::config(format!(
            "the {what} Deployment cannot be renamed from {recorded} to {wanted}"
        ))),
        _ => Ok(()),
    }
}

/// Generate the auth token when the user gave none and none was generated.
/// Returns whether a token was generated.
pub fn bootstrap_token(
    dda: &DatadogAgent,
    status: &mut DatadogAgentStatus,
    tokens: &dyn TokenGenerator,
) -> bool {
    let user_token = dda
        .spec
        .credentials
        .token
        .as_deref()
        .is_some_and(|t| !t.is_empty());
    if user_token || status.generated_token().is_some() {
        return false;
    }
    status
        .cluster_agent
        .get_or_insert_with(DeploymentStatus::default)
        .generated_token = Some(tokens.generate());
    true
}

fn pdb_needed(dda: &DatadogAgent) -> bool {
    dda.spec
        .cluster_agent
        .as_ref()
        .is_some_and(|c| c.replicas.unwrap_or(1) > 1)
}

pub async fn reconcile(
    client: &dyn ClusterClient,
    dda: &DatadogAgent,
    tokens: &dyn TokenGenerator,
    status: &mut DatadogAgentStatus,
) -> Result<Requeue> {
    let name = cluster_agent_deployment_name(dda);

    if dda.spec.cluster_agent.is_some() {
        check_rename(status.cluster_agent.as_ref(), &name, "cluster agent")?;
        if bootstrap_token(dda, status, tokens) {
            info!(name = %dda.name_any(), "generated cluster agent token");
            return Ok(Requeue::Now);
        }
    }

    let requeue = dependencies::credentials_secret(client, dda).await?;
    if requeue.is_requested() {
        return Ok(requeue);
    }
    let requeue = dependencies::custom_config(client, dda, Component::ClusterAgent).await?;
    if requeue.is_requested() {
        return Ok(requeue);
    }
    let requeue = dependencies::cluster_agent_services(client, dda).await?;
    if requeue.is_requested() {
        return Ok(requeue);
    }
    let requeue = dependencies::rbac(client, dda, Component::ClusterAgent).await?;
    if requeue.is_requested() {
        return Ok(requeue);
    }
    let requeue =
        dependencies::pod_disruption_budget(client, dda, Component::ClusterAgent, pdb_needed(dda))
            .await?;
    if requeue.is_requested() {
        return Ok(requeue);
    }

    if dda.spec.cluster_agent.is_none() {
        let ns = dda.namespace().unwrap_or_default();
        dependencies::cleanup(client, dda, ObjectKind::Deployment, &ns, &name).await?;
        status.cluster_agent = None;
        return Ok(Requeue::No);
    }

    let converged = converge_deployment(
        client,
        dda,
        &name,
        |selector| builders::cluster_agent_deployment(dda, selector),
        &mut status.cluster_agent,
    )
    .await?;

    if let Some(deployment) = &converged.existing {
        let observed = deployment.status.clone().unwrap_or_default();
        if observed.available_replicas.unwrap_or(0) == 0 {
            return Err(Error::not_ready(format!(
                "cluster agent deployment is not ready yet: 0 pods available out of {}",
                observed.replicas.unwrap_or(0)
            )));
        }
    }
    Ok(converged.requeue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::datadog_agent::{DatadogAgentSpec, DatadogAgentSpecClusterAgentSpec};

    struct Fixed(&'static str);

    impl TokenGenerator for Fixed {
        fn generate(&self) -> String {
            self.0.to_string()
        }
    }

    fn dda(token: Option<&str>) -> DatadogAgent {
        let mut dda = DatadogAgent::new(
            "foo",
            DatadogAgentSpec {
                cluster_agent: Some(DatadogAgentSpecClusterAgentSpec::default()),
                ..Default::default()
            },
        );
        dda.spec.credentials.token = token.map(str::to_string);
        dda
    }

    #[test]
    fn token_is_generated_once() {
        let d = dda(None);
        let mut status = DatadogAgentStatus::default();
        assert!(bootstrap_token(&d, &mut status, &Fixed("abc")));
        assert_eq!(status.generated_token(), Some("abc"));
        assert!(!bootstrap_token(&d, &mut status, &Fixed("def")));
        assert_eq!(status.generated_token(), Some("abc"));
    }

    #[test]
    fn user_token_skips_generation() {
        let d = dda(Some("mine"));
        let mut status = DatadogAgentStatus::default();
        assert!(!bootstrap_token(&d, &mut status, &Fixed("abc")));
        assert!(status.cluster_agent.is_none());
    }

    #[test]
    fn recorded_deployment_name_is_immutable() {
        let slot = DeploymentStatus {
            deployment_name: Some("foo-cluster-agent".into()),
            ..Default::default()
        };
        assert!(check_rename(Some(&slot), "foo-cluster-agent", "cluster agent").is_ok());
        let err = check_rename(Some(&slot), "other", "cluster agent").unwrap_err();
        assert!(err.is_configuration());
        assert!(check_rename(None, "other", "cluster agent").is_ok());
    }
}
