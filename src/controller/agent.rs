//! Node agent reconciler.
//!
//! The node agent runs either as a plain DaemonSet or as an ExtendedDaemonSet,
//! never both. Which mutation a pass performs is decided by [`AGENT_RULES`],
//! evaluated top to bottom against an [`AgentFacts`] snapshot; the first rule
//! whose guard holds wins.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::crd::datadog_agent::{DatadogAgent, DatadogAgentStatus};
use crate::crd::extended_daemonset::ExtendedDaemonSet;
use crate::error::{Error, Result};
use crate::helpers::{agent_daemonset_name, Component, ReconcilerOptions};

use super::builders;
use super::client::{create_as, get_as, update_as, ClusterClient, EventAction, Managed};
use super::dependencies::{self, prepare_update, record};
use super::hash;
use super::status::{daemonset_status, extended_daemonset_status};
use super::Requeue;

/// Delay after deleting one workload kind before the other is created.
pub const MIGRATION_DELAY: Duration = Duration::from_secs(5);
/// Delay after an update so the rollout shows up in the next status.
pub const UPDATE_DELAY: Duration = Duration::from_secs(5);

/// What the rule table looks at.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AgentFacts {
    /// The agent sub-spec is set.
    pub desired: bool,
    /// The ExtendedDaemonSet is requested and supported.
    pub canary_desired: bool,
    pub plain_found: bool,
    pub canary_found: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentAction {
    /// Delete whichever workload exists and clear the agent status.
    Teardown,
    DeletePlainForMigration,
    CreateCanary,
    UpdateCanary,
    DeleteCanaryForMigration,
    CreatePlain,
    UpdatePlain,
}

impl std::fmt::Display for AgentAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Teardown => "Teardown",
            Self::DeletePlainForMigration => "DeletePlainForMigration",
            Self::CreateCanary => "CreateCanary",
            Self::UpdateCanary => "UpdateCanary",
            Self::DeleteCanaryForMigration => "DeleteCanaryForMigration",
            Self::CreatePlain => "CreatePlain",
            Self::UpdatePlain => "UpdatePlain",
        };
        f.write_str(s)
    }
}

pub struct AgentRule {
    pub guard_name: &'static str,
    pub guard: fn(&AgentFacts) -> bool,
    pub action: AgentAction,
}

fn not_desired(f: &AgentFacts) -> bool {
    !f.desired
}

fn canary_wanted_plain_found(f: &AgentFacts) -> bool {
    f.canary_desired && f.plain_found
}

fn canary_wanted_canary_missing(f: &AgentFacts) -> bool {
    f.canary_desired && !f.canary_found
}

fn canary_wanted(f: &AgentFacts) -> bool {
    f.canary_desired
}

fn canary_found(f: &AgentFacts) -> bool {
    f.canary_found
}

fn plain_missing(f: &AgentFacts) -> bool {
    !f.plain_found
}

fn always(_: &AgentFacts) -> bool {
    true
}

pub static AGENT_RULES: &[AgentRule] = &[
    AgentRule {
        guard_name: "agent spec absent",
        guard: not_desired,
        action: AgentAction::Teardown,
    },
    AgentRule {
        guard_name: "canary wanted and DaemonSet found",
        guard: canary_wanted_plain_found,
        action: AgentAction::DeletePlainForMigration,
    },
    AgentRule {
        guard_name: "canary wanted and ExtendedDaemonSet missing",
        guard: canary_wanted_canary_missing,
        action: AgentAction::CreateCanary,
    },
    AgentRule {
        guard_name: "canary wanted and ExtendedDaemonSet found",
        guard: canary_wanted,
        action: AgentAction::UpdateCanary,
    },
    AgentRule {
        guard_name: "plain wanted and ExtendedDaemonSet found",
        guard: canary_found,
        action: AgentAction::DeleteCanaryForMigration,
    },
    AgentRule {
        guard_name: "plain wanted and DaemonSet missing",
        guard: plain_missing,
        action: AgentAction::CreatePlain,
    },
    AgentRule {
        guard_name: "plain wanted and DaemonSet found",
        guard: always,
        action: AgentAction::UpdatePlain,
    },
];

pub fn select_action(facts: &AgentFacts) -> AgentAction {
    AGENT_RULES
        .iter()
        .find(|rule| (rule.guard)(facts))
        .map(|rule| rule.action)
        .unwrap_or(AgentAction::UpdatePlain)
}

/// Live node agent workloads, looked up by their fixed name.
#[derive(Clone, Debug, Default)]
pub struct AgentSnapshot {
    pub plain: Option<DaemonSet>,
    pub canary: Option<ExtendedDaemonSet>,
}

impl AgentSnapshot {
    pub async fn gather(
        client: &dyn ClusterClient,
        dda: &DatadogAgent,
        options: &ReconcilerOptions,
    ) -> Result<Self> {
        let ns = dda.namespace().unwrap_or_default();
        let name = agent_daemonset_name(dda);
        let plain = get_as::<DaemonSet>(client, &ns, &name).await?;
        // Without the CRD there is nothing to find.
        let canary = if options.support_extended_daemonset {
            get_as::<ExtendedDaemonSet>(client, &ns, &name).await?
        } else {
            None
        };
        Ok(Self { plain, canary })
    }

    pub fn facts(&self, dda: &DatadogAgent, options: &ReconcilerOptions) -> AgentFacts {
        AgentFacts {
            desired: dda.spec.agent.is_some(),
            canary_desired: canary_desired(dda, options),
            plain_found: self.plain.is_some(),
            canary_found: self.canary.is_some(),
        }
    }
}

fn canary_desired(dda: &DatadogAgent, options: &ReconcilerOptions) -> bool {
    options.support_extended_daemonset
        && dda
            .spec
            .agent
            .as_ref()
            .and_then(|a| a.use_extended_daemonset)
            .unwrap_or(false)
}

/// The workload name is fixed once it shows up in status.
fn check_rename(dda: &DatadogAgent, status: &DatadogAgentStatus) -> Result<()> {
    let recorded = status
        .agent
        .as_ref()
        .and_then(|s| s.daemonset_name.as_deref())
        .filter(|n| !n.is_empty());
    let wanted = agent_daemonset_name(dda);
    match recorded {
        Some(recorded) if recorded != wanted => Err(Error::config(format!(
            "the agent DaemonSet cannot be renamed from {recorded} to {wanted}"
        ))),
        _ => Ok(()),
    }
}

fn now() -> Time {
    Time(Utc::now())
}

async fn delete_workload<T: Managed>(
    client: &dyn ClusterClient,
    dda: &DatadogAgent,
    name: &str,
) -> Result<()> {
    let ns = dda.namespace().unwrap_or_default();
    client.delete(T::KIND, &ns, name).await?;
    record(client, dda, EventAction::Deleted, T::KIND, &ns, name).await;
    Ok(())
}

/// One pass of the node agent state machine. Dependencies are reconciled
/// first; `status` is the status being built for this pass.
pub async fn reconcile(
    client: &dyn ClusterClient,
    dda: &DatadogAgent,
    options: &ReconcilerOptions,
    status: &mut DatadogAgentStatus,
) -> Result<Requeue> {
    if dda.spec.agent.is_some() {
        check_rename(dda, status)?;
    }

    let requeue = dependencies::credentials_secret(client, dda).await?;
    if requeue.is_requested() {
        return Ok(requeue);
    }
    let requeue = dependencies::custom_config(client, dda, Component::Agent).await?;
    if requeue.is_requested() {
        return Ok(requeue);
    }
    let requeue = dependencies::rbac(client, dda, Component::Agent).await?;
    if requeue.is_requested() {
        return Ok(requeue);
    }

    let snapshot = AgentSnapshot::gather(client, dda, options).await?;
    let action = select_action(&snapshot.facts(dda, options));
    let name = agent_daemonset_name(dda);
    debug!(%name, %action, "agent rule selected");

    match action {
        AgentAction::Teardown => {
            let ns = dda.namespace().unwrap_or_default();
            if snapshot.plain.is_some() {
                dependencies::cleanup(client, dda, <DaemonSet as Managed>::KIND, &ns, &name).await?;
            }
            if snapshot.canary.is_some() {
                dependencies::cleanup(client, dda, <ExtendedDaemonSet as Managed>::KIND, &ns, &name)
                    .await?;
            }
            status.agent = None;
            Ok(Requeue::No)
        }
        AgentAction::DeletePlainForMigration => {
            info!(%name, "switching node agent to ExtendedDaemonSet");
            delete_workload::<DaemonSet>(client, dda, &name).await?;
            status.agent = None;
            Ok(Requeue::After(MIGRATION_DELAY))
        }
        AgentAction::DeleteCanaryForMigration => {
            info!(%name, "switching node agent to DaemonSet");
            delete_workload::<ExtendedDaemonSet>(client, dda, &name).await?;
            status.agent = None;
            Ok(Requeue::After(MIGRATION_DELAY))
        }
        AgentAction::CreatePlain => {
            let built = builders::agent_daemonset(dda, None)?;
            match create_as(client, built.object).await {
                Ok(created) => {
                    record_created(client, dda, <DaemonSet as Managed>::KIND, &name).await;
                    status.agent = Some(daemonset_status(
                        Some(&created),
                        status.agent.as_ref(),
                        Some(now()),
                    ));
                    Ok(Requeue::No)
                }
                Err(e) => {
                    status.agent = Some(daemonset_status(None, status.agent.as_ref(), None));
                    Err(e)
                }
            }
        }
        AgentAction::CreateCanary => {
            let built = builders::agent_extended_daemonset(dda, None)?;
            match create_as(client, built.object).await {
                Ok(created) => {
                    record_created(client, dda, <ExtendedDaemonSet as Managed>::KIND, &name).await;
                    status.agent = Some(extended_daemonset_status(
                        &created,
                        status.agent.as_ref(),
                        Some(now()),
                    ));
                    Ok(Requeue::No)
                }
                Err(e) => {
                    status.agent = Some(daemonset_status(None, status.agent.as_ref(), None));
                    Err(e)
                }
            }
        }
        AgentAction::UpdatePlain => {
            let Some(live) = snapshot.plain else {
                return Err(Error::reconcile("agent DaemonSet vanished during the pass"));
            };
            let selector = live.spec.as_ref().map(|s| &s.selector);
            let built = builders::agent_daemonset(dda, selector)?;
            if hash::matches(&built.digest, &live.metadata) {
                status.agent = Some(daemonset_status(Some(&live), status.agent.as_ref(), None));
                return Ok(Requeue::No);
            }
            let updated = update_as(client, prepare_update(&built.object, &live)).await?;
            record(
                client,
                dda,
                EventAction::Updated,
                <DaemonSet as Managed>::KIND,
                &dda.namespace().unwrap_or_default(),
                &name,
            )
            .await;
            status.agent = Some(daemonset_status(
                Some(&updated),
                status.agent.as_ref(),
                Some(now()),
            ));
            Ok(Requeue::After(UPDATE_DELAY))
        }
        AgentAction::UpdateCanary => {
            let Some(live) = snapshot.canary else {
                return Err(Error::reconcile("agent ExtendedDaemonSet vanished during the pass"));
            };
            let built = builders::agent_extended_daemonset(dda, live.spec.selector.as_ref())?;
            if hash::matches(&built.digest, &live.metadata) {
                status.agent = Some(extended_daemonset_status(&live, status.agent.as_ref(), None));
                return Ok(Requeue::No);
            }
            let updated = update_as(client, prepare_update(&built.object, &live)).await?;
            record(
                client,
                dda,
                EventAction::Updated,
                <ExtendedDaemonSet as Managed>::KIND,
                &dda.namespace().unwrap_or_default(),
                &name,
            )
            .await;
            status.agent = Some(extended_daemonset_status(
                &updated,
                status.agent.as_ref(),
                Some(now()),
            ));
            Ok(Requeue::After(UPDATE_DELAY))
        }
    }
}

async fn record_created(
    client: &dyn ClusterClient,
    dda: &DatadogAgent,
    kind: super::client::ObjectKind,
    name: &str,
) {
    let ns = dda.namespace().unwrap_or_default();
    record(client, dda, EventAction::Created, kind, &ns, name).await;
}
