//! One-time spec defaulting.
//!
//! [`apply_defaults`] fills every unset field the reconcilers rely on. It is a
//! fixed point: a second call on its own output changes nothing, so the
//! orchestration loop can persist the result and requeue until it reports
//! no change.

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::datadog_agent::{
    DaemonSetDeploymentStrategy, DatadogAgentSpec, DatadogAgentSpecAgentSpec,
    DatadogAgentSpecClusterAgentSpec, DatadogAgentSpecClusterChecksRunnerSpec, ImageConfig,
    RbacConfig,
};
use crate::crd::extended_daemonset::ExtendedDaemonSetSpecStrategyCanary;
use crate::helpers::OperatorDefaults;

use super::builders::DEFAULT_METRICS_PROVIDER_PORT;

pub const DEFAULT_PULL_POLICY: &str = "IfNotPresent";
pub const DEFAULT_LOG_LEVEL: &str = "INFO";
pub const DEFAULT_MAX_UNAVAILABLE: &str = "10%";
pub const DEFAULT_CANARY_DURATION: &str = "10m";
pub const DEFAULT_RECONCILE_FREQUENCY: &str = "10s";
pub const DEFAULT_CLUSTER_AGENT_REPLICAS: i32 = 1;
pub const DEFAULT_CLUSTER_CHECKS_RUNNER_REPLICAS: i32 = 2;

/// Set `slot` to `value` when unset. Returns whether it changed.
fn fill<T>(slot: &mut Option<T>, value: impl FnOnce() -> T) -> bool {
    if slot.is_some() {
        return false;
    }
    *slot = Some(value());
    true
}

fn fill_image(image: &mut ImageConfig, default_name: &str) -> bool {
    let mut changed = false;
    if image.name.is_empty() {
        image.name = default_name.to_string();
        changed = true;
    }
    changed |= fill(&mut image.pull_policy, || DEFAULT_PULL_POLICY.to_string());
    changed
}

fn fill_rbac(rbac: &mut RbacConfig) -> bool {
    fill(&mut rbac.create, || true)
}

fn default_agent(agent: &mut DatadogAgentSpecAgentSpec, defaults: &OperatorDefaults) -> bool {
    let mut changed = fill(&mut agent.use_extended_daemonset, || false);
    changed |= fill_image(&mut agent.image, &defaults.agent_image);
    changed |= fill(&mut agent.config.log_level, || DEFAULT_LOG_LEVEL.to_string());
    changed |= fill(&mut agent.config.collect_events, || false);
    changed |= fill(&mut agent.config.leader_election, || false);
    changed |= fill_rbac(&mut agent.rbac);

    changed |= fill(&mut agent.deployment_strategy, DaemonSetDeploymentStrategy::default);
    if let Some(strategy) = agent.deployment_strategy.as_mut() {
        changed |= fill(&mut strategy.update_strategy_type, || "RollingUpdate".to_string());
        changed |= fill(&mut strategy.rolling_update.max_unavailable, || {
            IntOrString::String(DEFAULT_MAX_UNAVAILABLE.to_string())
        });
        changed |= fill(&mut strategy.canary, ExtendedDaemonSetSpecStrategyCanary::default);
        if let Some(canary) = strategy.canary.as_mut() {
            changed |= fill(&mut canary.replicas, || IntOrString::Int(1));
            changed |= fill(&mut canary.duration, || DEFAULT_CANARY_DURATION.to_string());
        }
        changed |= fill(&mut strategy.reconcile_frequency, || {
            DEFAULT_RECONCILE_FREQUENCY.to_string()
        });
    }

    changed |= fill(&mut agent.apm.enabled, || false);
    changed |= fill(&mut agent.log.enabled, || false);
    changed |= fill(&mut agent.log.logs_config_container_collect_all, || false);
    changed |= fill(&mut agent.process.enabled, || false);
    changed |= fill(&mut agent.system_probe.enabled, || false);
    changed
}

fn default_cluster_agent(
    cluster_agent: &mut DatadogAgentSpecClusterAgentSpec,
    defaults: &OperatorDefaults,
) -> bool {
    let mut changed = fill_image(&mut cluster_agent.image, &defaults.cluster_agent_image);
    changed |= fill(&mut cluster_agent.config.cluster_checks_enabled, || false);
    changed |= fill(&mut cluster_agent.config.collect_events, || false);
    changed |= fill_rbac(&mut cluster_agent.rbac);
    changed |= fill(&mut cluster_agent.replicas, || DEFAULT_CLUSTER_AGENT_REPLICAS);
    if cluster_agent.config.metrics_provider_enabled.is_some() {
        changed |= fill(&mut cluster_agent.config.metrics_provider_port, || {
            DEFAULT_METRICS_PROVIDER_PORT
        });
    }
    changed
}

fn default_cluster_checks_runner(
    runner: &mut DatadogAgentSpecClusterChecksRunnerSpec,
    defaults: &OperatorDefaults,
) -> bool {
    let mut changed = fill_image(&mut runner.image, &defaults.cluster_checks_runner_image);
    changed |= fill_rbac(&mut runner.rbac);
    changed |= fill(&mut runner.replicas, || DEFAULT_CLUSTER_CHECKS_RUNNER_REPLICAS);
    changed
}

/// Fill unset fields of `spec` in place. Returns whether anything changed.
pub fn apply_defaults(spec: &mut DatadogAgentSpec, defaults: &OperatorDefaults) -> bool {
    let mut changed = false;
    if let Some(agent) = spec.agent.as_mut() {
        changed |= default_agent(agent, defaults);
    }
    if let Some(cluster_agent) = spec.cluster_agent.as_mut() {
        changed |= default_cluster_agent(cluster_agent, defaults);
        if cluster_agent.cluster_checks_enabled() {
            changed |= fill(
                &mut spec.cluster_checks_runner,
                DatadogAgentSpecClusterChecksRunnerSpec::default,
            );
        }
    }
    if let Some(runner) = spec.cluster_checks_runner.as_mut() {
        changed |= default_cluster_checks_runner(runner, defaults);
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::datadog_agent::ClusterAgentConfig;

    fn full_spec() -> DatadogAgentSpec {
        DatadogAgentSpec {
            agent: Some(DatadogAgentSpecAgentSpec::default()),
            cluster_agent: Some(DatadogAgentSpecClusterAgentSpec {
                config: ClusterAgentConfig {
                    cluster_checks_enabled: Some(true),
                    metrics_provider_enabled: Some(true),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn defaulting_reaches_a_fixed_point_in_one_call() {
        let defaults = OperatorDefaults::default();
        let mut spec = full_spec();
        assert!(apply_defaults(&mut spec, &defaults));
        let once = spec.clone();
        assert!(!apply_defaults(&mut spec, &defaults));
        assert_eq!(spec, once);
    }

    #[test]
    fn images_come_from_operator_configuration() {
        let defaults = OperatorDefaults {
            agent_image: "registry/agent:7".into(),
            cluster_agent_image: "registry/cluster-agent:1".into(),
            cluster_checks_runner_image: "registry/agent:7".into(),
        };
        let mut spec = full_spec();
        apply_defaults(&mut spec, &defaults);
        assert_eq!(spec.agent.as_ref().unwrap().image.name, "registry/agent:7");
        assert_eq!(
            spec.cluster_agent.as_ref().unwrap().image.name,
            "registry/cluster-agent:1"
        );
        assert_eq!(
            spec.cluster_checks_runner.as_ref().unwrap().image.name,
            "registry/agent:7"
        );
    }

    #[test]
    fn user_values_are_kept() {
        let mut spec = DatadogAgentSpec {
            agent: Some(DatadogAgentSpecAgentSpec {
                image: ImageConfig {
                    name: "agent:6.14.0".into(),
                    pull_policy: Some("Always".into()),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        apply_defaults(&mut spec, &OperatorDefaults::default());
        let agent = spec.agent.unwrap();
        assert_eq!(agent.image.name, "agent:6.14.0");
        assert_eq!(agent.image.pull_policy.as_deref(), Some("Always"));
        assert_eq!(agent.use_extended_daemonset, Some(false));
        assert_eq!(agent.rbac.create, Some(true));
    }

    #[test]
    fn cluster_checks_add_a_runner_and_metrics_port() {
        let mut spec = full_spec();
        apply_defaults(&mut spec, &OperatorDefaults::default());
        let runner = spec.cluster_checks_runner.unwrap();
        assert_eq!(runner.replicas, Some(DEFAULT_CLUSTER_CHECKS_RUNNER_REPLICAS));
        assert_eq!(
            spec.cluster_agent.unwrap().config.metrics_provider_port,
            Some(DEFAULT_METRICS_PROVIDER_PORT)
        );
    }

    #[test]
    fn absent_components_stay_absent() {
        let mut spec = DatadogAgentSpec::default();
        assert!(!apply_defaults(&mut spec, &OperatorDefaults::default()));
        assert!(spec.agent.is_none());
        assert!(spec.cluster_checks_runner.is_none());
    }
}
