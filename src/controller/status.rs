//! Status aggregation.
//!
//! Component status is rebuilt from the live workload on every pass. The
//! discrete state comes from [`STATE_PRECEDENCE`], an ordered table whose
//! first matching row wins; `Running` applies when no row matches.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::crd::datadog_agent::{
    AgentState, DaemonSetStatus, DatadogAgentCondition, DatadogAgentConditionType,
    DatadogAgentStatus, DeploymentStatus,
};
use crate::crd::extended_daemonset::ExtendedDaemonSet;

use super::hash;

/// Observed counters of a workload, normalized across kinds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkloadCounts {
    pub desired: i32,
    pub ready: i32,
    pub up_to_date: i32,
    /// The workload reports an explicit failure.
    pub failed: bool,
    /// A canary rollout is in progress.
    pub canary: bool,
}

/// One row of the precedence table.
pub struct StateRule {
    pub description: &'static str,
    pub applies: fn(&WorkloadCounts) -> bool,
    pub state: AgentState,
}

fn has_failed(c: &WorkloadCounts) -> bool {
    c.failed
}

fn has_canary(c: &WorkloadCounts) -> bool {
    c.canary
}

fn is_updating(c: &WorkloadCounts) -> bool {
    c.up_to_date != c.desired
}

fn has_no_ready(c: &WorkloadCounts) -> bool {
    c.ready == 0
}

/// Evaluated top to bottom. A failing canary reports `Failed`.
pub static STATE_PRECEDENCE: &[StateRule] = &[
    StateRule {
        description: "workload reports a failure",
        applies: has_failed,
        state: AgentState::Failed,
    },
    StateRule {
        description: "canary rollout active",
        applies: has_canary,
        state: AgentState::Canary,
    },
    StateRule {
        description: "up-to-date count differs from desired",
        applies: is_updating,
        state: AgentState::Updating,
    },
    StateRule {
        description: "no ready replica",
        applies: has_no_ready,
        state: AgentState::Progressing,
    },
];

/// State used when no rule of [`STATE_PRECEDENCE`] applies.
pub const DEFAULT_STATE: AgentState = AgentState::Running;

pub fn derive_state(counts: &WorkloadCounts) -> AgentState {
    STATE_PRECEDENCE
        .iter()
        .find(|rule| (rule.applies)(counts))
        .map(|rule| rule.state)
        .unwrap_or(DEFAULT_STATE)
}

fn status_line(state: AgentState, desired: i32, ready: i32, up_to_date: i32) -> String {
    format!("{state} ({desired}/{ready}/{up_to_date})")
}

// ── Per-kind refresh ──────────────────────────────────────────────────────────

/// Node agent status from a plain DaemonSet. A missing DaemonSet (failed
/// create) is reported as `Failed`.
pub fn daemonset_status(
    ds: Option<&DaemonSet>,
    previous: Option<&DaemonSetStatus>,
    updated_at: Option<Time>,
) -> DaemonSetStatus {
    let mut status = previous.cloned().unwrap_or_default();
    let Some(ds) = ds else {
        status.state = Some(AgentState::Failed);
        status.status = Some(AgentState::Failed.to_string());
        return status;
    };
    if updated_at.is_some() {
        status.last_update = updated_at;
    }
    let observed = ds.status.clone().unwrap_or_default();
    status.current_hash = hash::stamped(&ds.metadata).map(str::to_string);
    status.desired = observed.desired_number_scheduled;
    status.current = observed.current_number_scheduled;
    status.ready = observed.number_ready;
    status.available = observed.number_available.unwrap_or(0);
    status.up_to_date = observed.updated_number_scheduled.unwrap_or(0);

    let state = derive_state(&WorkloadCounts {
        desired: status.desired,
        ready: status.ready,
        up_to_date: status.up_to_date,
        failed: false,
        canary: false,
    });
    status.state = Some(state);
    status.status = Some(status_line(state, status.desired, status.ready, status.up_to_date));
    status.daemonset_name = ds.metadata.name.clone();
    status
}

/// Node agent status from an ExtendedDaemonSet.
pub fn extended_daemonset_status(
    eds: &ExtendedDaemonSet,
    previous: Option<&DaemonSetStatus>,
    updated_at: Option<Time>,
) -> DaemonSetStatus {
    let mut status = previous.cloned().unwrap_or_default();
    if updated_at.is_some() {
        status.last_update = updated_at;
    }
    let observed = eds.status.clone().unwrap_or_default();
    status.current_hash = hash::stamped(&eds.metadata).map(str::to_string);
    status.desired = observed.desired;
    status.current = observed.current;
    status.ready = observed.ready;
    status.available = observed.available;
    status.up_to_date = observed.up_to_date;

    let state = derive_state(&WorkloadCounts {
        desired: status.desired,
        ready: status.ready,
        up_to_date: status.up_to_date,
        failed: observed.is_failed(),
        canary: observed.has_active_canary(),
    });
    status.state = Some(state);
    status.status = Some(status_line(state, status.desired, status.ready, status.up_to_date));
    status.daemonset_name = eds.metadata.name.clone();
    status
}

/// Cluster agent or cluster checks runner status from its Deployment. Fields
/// not derived from the Deployment, such as the generated token, are kept.
pub fn deployment_status(
    deployment: Option<&Deployment>,
    previous: Option<&DeploymentStatus>,
    updated_at: Option<Time>,
) -> DeploymentStatus {
    let mut status = previous.cloned().unwrap_or_default();
    let Some(deployment) = deployment else {
        status.state = Some(AgentState::Failed);
        status.status = Some(AgentState::Failed.to_string());
        return status;
    };
    if updated_at.is_some() {
        status.last_update = updated_at;
    }
    let observed = deployment.status.clone().unwrap_or_default();
    status.current_hash = hash::stamped(&deployment.metadata).map(str::to_string);
    status.replicas = observed.replicas.unwrap_or(0);
    status.updated_replicas = observed.updated_replicas.unwrap_or(0);
    status.ready_replicas = observed.ready_replicas.unwrap_or(0);
    status.available_replicas = observed.available_replicas.unwrap_or(0);
    status.unavailable_replicas = observed.unavailable_replicas.unwrap_or(0);

    let replica_failure = observed
        .conditions
        .unwrap_or_default()
        .iter()
        .any(|c| c.type_ == "ReplicaFailure" && c.status == "True");
    let state = derive_state(&WorkloadCounts {
        desired: status.replicas,
        ready: status.ready_replicas,
        up_to_date: status.updated_replicas,
        failed: replica_failure,
        canary: false,
    });
    status.state = Some(state);
    status.status = Some(status_line(
        state,
        status.replicas,
        status.ready_replicas,
        status.updated_replicas,
    ));
    status.deployment_name = deployment.metadata.name.clone();
    status
}

// ── Conditions ────────────────────────────────────────────────────────────────

const STATUS_TRUE: &str = "True";
const STATUS_FALSE: &str = "False";

/// Upsert a condition. Timestamps move only when something about the
/// condition changes; `last_transition_time` only when its status flips.
/// A `False` condition is not added when absent unless `write_false`.
pub fn set_condition(
    status: &mut DatadogAgentStatus,
    type_: DatadogAgentConditionType,
    value: bool,
    reason: &str,
    message: &str,
    now: &Time,
    write_false: bool,
) {
    let value = if value { STATUS_TRUE } else { STATUS_FALSE };
    match status.conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(condition) => {
            let flipped = condition.status != value;
            let changed = flipped
                || condition.reason.as_deref() != Some(reason)
                || condition.message.as_deref() != Some(message);
            if flipped {
                condition.status = value.to_string();
                condition.last_transition_time = now.clone();
            }
            if changed {
                condition.reason = Some(reason.to_string());
                condition.message = Some(message.to_string());
                condition.last_update_time = now.clone();
            }
        }
        None if value == STATUS_TRUE || write_false => {
            status.conditions.push(DatadogAgentCondition {
                type_,
                status: value.to_string(),
                last_transition_time: now.clone(),
                last_update_time: now.clone(),
                reason: Some(reason.to_string()),
                message: Some(message.to_string()),
            });
        }
        None => {}
    }
}

/// Fold the outcome of a pass into the `Active` and `ReconcileError`
/// conditions. `error` is the message of the error that ended the pass.
pub fn fold_conditions(status: &mut DatadogAgentStatus, error: Option<&str>, now: &Time) {
    match error {
        Some(message) => {
            set_condition(
                status,
                DatadogAgentConditionType::ReconcileError,
                true,
                "DatadogAgent_reconcile_error",
                message,
                now,
                true,
            );
            set_condition(
                status,
                DatadogAgentConditionType::Active,
                false,
                "DatadogAgent_reconcile_error",
                "DatadogAgent reconcile error",
                now,
                true,
            );
        }
        None => {
            set_condition(
                status,
                DatadogAgentConditionType::ReconcileError,
                false,
                "DatadogAgent_reconcile_ok",
                "",
                now,
                false,
            );
            set_condition(
                status,
                DatadogAgentConditionType::Active,
                true,
                "DatadogAgent_reconcile_ok",
                "DatadogAgent reconcile ok",
                now,
                true,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::extended_daemonset::{
        ExtendedDaemonSetSpec, ExtendedDaemonSetStatus, ExtendedDaemonSetStatusCanary,
        STATE_CANARY_FAILED,
    };
    use chrono::{TimeZone, Utc};
    use k8s_openapi::api::apps::v1::{
        DaemonSetStatus as K8sDaemonSetStatus, DeploymentCondition,
        DeploymentStatus as K8sDeploymentStatus,
    };
    use kube::api::ObjectMeta;

    fn at(secs: i64) -> Time {
        Time(Utc.timestamp_opt(secs, 0).unwrap())
    }

    fn counts(desired: i32, ready: i32, up_to_date: i32) -> WorkloadCounts {
        WorkloadCounts {
            desired,
            ready,
            up_to_date,
            ..Default::default()
        }
    }

    #[test]
    fn precedence_is_evaluated_in_order() {
        assert_eq!(derive_state(&counts(3, 3, 3)), AgentState::Running);
        assert_eq!(derive_state(&counts(3, 0, 3)), AgentState::Progressing);
        assert_eq!(derive_state(&counts(3, 0, 1)), AgentState::Updating);
        let canary = WorkloadCounts {
            canary: true,
            ..counts(3, 0, 1)
        };
        assert_eq!(derive_state(&canary), AgentState::Canary);
        let failing_canary = WorkloadCounts {
            failed: true,
            ..canary
        };
        assert_eq!(derive_state(&failing_canary), AgentState::Failed);
    }

    #[test]
    fn table_order_matches_documented_precedence() {
        let order: Vec<_> = STATE_PRECEDENCE.iter().map(|r| r.state).collect();
        assert_eq!(
            order,
            vec![
                AgentState::Failed,
                AgentState::Canary,
                AgentState::Updating,
                AgentState::Progressing
            ]
        );
    }

    #[test]
    fn daemonset_status_is_rebuilt_from_live_object() {
        let mut meta = ObjectMeta {
            name: Some("foo-agent".into()),
            ..Default::default()
        };
        let digest = hash::stamp(&mut meta, "spec").unwrap();
        let ds = DaemonSet {
            metadata: meta,
            status: Some(K8sDaemonSetStatus {
                desired_number_scheduled: 3,
                current_number_scheduled: 3,
                number_ready: 2,
                number_available: Some(2),
                updated_number_scheduled: Some(3),
                ..Default::default()
            }),
            ..Default::default()
        };
        let status = daemonset_status(Some(&ds), None, Some(at(10)));
        assert_eq!(status.state, Some(AgentState::Running));
        assert_eq!(status.status.as_deref(), Some("Running (3/2/3)"));
        assert_eq!(status.current_hash.as_deref(), Some(digest.as_str()));
        assert_eq!(status.daemonset_name.as_deref(), Some("foo-agent"));
        assert_eq!(status.last_update, Some(at(10)));

        let refreshed = daemonset_status(Some(&ds), Some(&status), None);
        assert_eq!(refreshed.last_update, Some(at(10)));
    }

    #[test]
    fn missing_workload_is_failed() {
        let status = daemonset_status(None, None, None);
        assert_eq!(status.state, Some(AgentState::Failed));
        assert_eq!(status.status.as_deref(), Some("Failed"));
    }

    #[test]
    fn failed_canary_beats_active_canary() {
        let mut eds = ExtendedDaemonSet::new("foo-agent", ExtendedDaemonSetSpec::default());
        eds.status = Some(ExtendedDaemonSetStatus {
            desired: 3,
            ready: 3,
            up_to_date: 1,
            canary: Some(ExtendedDaemonSetStatusCanary {
                replica_set: "foo-agent-abc".into(),
                nodes: vec!["node-1".into()],
            }),
            ..Default::default()
        });
        let status = extended_daemonset_status(&eds, None, None);
        assert_eq!(status.state, Some(AgentState::Canary));

        eds.status.as_mut().unwrap().state = Some(STATE_CANARY_FAILED.into());
        let status = extended_daemonset_status(&eds, None, None);
        assert_eq!(status.state, Some(AgentState::Failed));
    }

    #[test]
    fn deployment_replica_failure_is_failed_and_token_is_kept() {
        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some("foo-cluster-agent".into()),
                ..Default::default()
            },
            status: Some(K8sDeploymentStatus {
                replicas: Some(1),
                updated_replicas: Some(1),
                ready_replicas: Some(1),
                conditions: Some(vec![DeploymentCondition {
                    type_: "ReplicaFailure".into(),
                    status: "True".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let previous = DeploymentStatus {
            generated_token: Some("tok".into()),
            ..Default::default()
        };
        let status = deployment_status(Some(&deployment), Some(&previous), None);
        assert_eq!(status.state, Some(AgentState::Failed));
        assert_eq!(status.generated_token.as_deref(), Some("tok"));
        assert_eq!(status.deployment_name.as_deref(), Some("foo-cluster-agent"));
    }

    #[test]
    fn conditions_fold_error_then_recovery() {
        let mut status = DatadogAgentStatus::default();
        fold_conditions(&mut status, Some("boom"), &at(1));
        let err = status.condition(DatadogAgentConditionType::ReconcileError).unwrap();
        assert_eq!(err.status, "True");
        assert_eq!(err.message.as_deref(), Some("boom"));
        let active = status.condition(DatadogAgentConditionType::Active).unwrap();
        assert_eq!(active.status, "False");

        fold_conditions(&mut status, None, &at(2));
        let err = status.condition(DatadogAgentConditionType::ReconcileError).unwrap();
        assert_eq!(err.status, "False");
        assert_eq!(err.last_transition_time, at(2));
        let active = status.condition(DatadogAgentConditionType::Active).unwrap();
        assert_eq!(active.status, "True");
    }

    #[test]
    fn clean_pass_does_not_add_error_condition() {
        let mut status = DatadogAgentStatus::default();
        fold_conditions(&mut status, None, &at(1));
        assert_eq!(status.conditions.len(), 1);
        assert!(status.condition(DatadogAgentConditionType::ReconcileError).is_none());
    }

    #[test]
    fn unchanged_condition_keeps_timestamps() {
        let mut status = DatadogAgentStatus::default();
        fold_conditions(&mut status, None, &at(1));
        let before = status.clone();
        fold_conditions(&mut status, None, &at(99));
        assert_eq!(status, before);
    }
}
