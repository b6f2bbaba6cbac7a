//! Desired-state builders.
//!
//! Pure functions from a DatadogAgent to the objects it should produce. Each
//! workload builder takes the selector of the live object when there is one:
//! selectors are immutable, so an existing selector is kept verbatim and a new
//! one is synthesized from the identity labels only on first creation.
//!
//! Builders hash the inputs that shape the object and stamp the digest on it
//! (see [`super::hash`]), so identical inputs always yield identical digests.

use std::collections::BTreeMap;

use k8s_openapi::api::{
    apps::v1::{
        DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, Deployment, DeploymentSpec,
        RollingUpdateDaemonSet,
    },
    core::v1::{
        ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, HTTPGetAction,
        HostPathVolumeSource, KeyToPath, PodSpec, PodTemplateSpec, Probe, Secret,
        SecurityContext, Service, ServiceAccount, ServicePort, ServiceSpec, Volume, VolumeMount,
    },
    policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec},
    rbac::v1::{
        ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
    },
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use serde::Serialize;

use crate::crd::datadog_agent::{
    AgentCredentials, CustomConfigSpec, DatadogAgent, DatadogAgentSpecAgentSpec,
    DatadogAgentSpecClusterAgentSpec, DatadogAgentSpecClusterChecksRunnerSpec, ImageConfig,
};
use crate::crd::extended_daemonset::{
    ExtendedDaemonSet, ExtendedDaemonSetSpec, ExtendedDaemonSetSpecStrategy,
    ExtendedDaemonSetSpecStrategyRollingUpdate,
};
use crate::error::{Error, Result};
use crate::helpers::{
    agent_daemonset_name, cluster_agent_deployment_name, cluster_agent_service_name,
    cluster_checks_runner_deployment_name, component_labels, credentials_secret_name,
    custom_config_map, identity_labels, metrics_server_service_name, pdb_name,
    rbac_resources_name, service_account_name, Component,
};

use super::hash;
use super::helpers::{
    cluster_meta, env, field_env, merge_selector_labels, owned_meta, secret_env,
    selector_or_default,
};

/// A built object and the digest stamped on it.
#[derive(Clone, Debug)]
pub struct Built<T> {
    pub object: T,
    pub digest: String,
}

pub const CLUSTER_AGENT_PORT: i32 = 5005;
pub const DEFAULT_METRICS_PROVIDER_PORT: i32 = 8443;
const HEALTH_PORT: i32 = 5555;

const API_KEY: &str = "api_key";
const APP_KEY: &str = "app_key";
const TOKEN_KEY: &str = "token";

// ── Hash inputs ───────────────────────────────────────────────────────────────

/// Everything that shapes the node agent pods.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentInputs<'a> {
    agent: &'a DatadogAgentSpecAgentSpec,
    credentials: &'a AgentCredentials,
    cluster_name: Option<&'a str>,
    site: Option<&'a str>,
    cluster_agent_enabled: bool,
    cluster_checks_runner_enabled: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterAgentInputs<'a> {
    cluster_agent: &'a DatadogAgentSpecClusterAgentSpec,
    credentials: &'a AgentCredentials,
    cluster_name: Option<&'a str>,
    site: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterChecksRunnerInputs<'a> {
    cluster_checks_runner: &'a DatadogAgentSpecClusterChecksRunnerSpec,
    credentials: &'a AgentCredentials,
    cluster_name: Option<&'a str>,
    site: Option<&'a str>,
}

fn agent_spec(dda: &DatadogAgent) -> Result<&DatadogAgentSpecAgentSpec> {
    dda.spec
        .agent
        .as_ref()
        .ok_or_else(|| Error::reconcile("agent spec is not set"))
}

fn cluster_agent_spec(dda: &DatadogAgent) -> Result<&DatadogAgentSpecClusterAgentSpec> {
    dda.spec
        .cluster_agent
        .as_ref()
        .ok_or_else(|| Error::reconcile("clusterAgent spec is not set"))
}

fn cluster_checks_runner_spec(dda: &DatadogAgent) -> Result<&DatadogAgentSpecClusterChecksRunnerSpec> {
    dda.spec
        .cluster_checks_runner
        .as_ref()
        .ok_or_else(|| Error::reconcile("clusterChecksRunner spec is not set"))
}

/// The cluster checks runner runs only next to a cluster agent that
/// dispatches cluster checks.
pub fn cluster_checks_runner_enabled(dda: &DatadogAgent) -> bool {
    dda.spec.cluster_checks_runner.is_some()
        && dda
            .spec
            .cluster_agent
            .as_ref()
            .is_some_and(|c| c.cluster_checks_enabled())
}

fn flag(value: Option<bool>) -> String {
    value.unwrap_or(false).to_string()
}

// ── Env vars ──────────────────────────────────────────────────────────────────

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.is_empty())
}

fn api_key_env(dda: &DatadogAgent) -> EnvVar {
    let creds = &dda.spec.credentials;
    if creds.use_secret_backend == Some(true) {
        if let Some(key) = non_empty(creds.api_key.as_ref()) {
            return env("DD_API_KEY", key);
        }
    }
    let secret = non_empty(creds.api_key_existing_secret.as_ref())
        .map(str::to_string)
        .unwrap_or_else(|| credentials_secret_name(dda));
    secret_env("DD_API_KEY", &secret, API_KEY)
}

fn app_key_env(dda: &DatadogAgent) -> Option<EnvVar> {
    let creds = &dda.spec.credentials;
    if creds.use_secret_backend == Some(true) {
        if let Some(key) = non_empty(creds.app_key.as_ref()) {
            return Some(env("DD_APP_KEY", key));
        }
    }
    if let Some(secret) = non_empty(creds.app_key_existing_secret.as_ref()) {
        return Some(secret_env("DD_APP_KEY", secret, APP_KEY));
    }
    non_empty(creds.app_key.as_ref())
        .map(|_| secret_env("DD_APP_KEY", &credentials_secret_name(dda), APP_KEY))
}

fn auth_token_env(dda: &DatadogAgent) -> EnvVar {
    secret_env(
        "DD_CLUSTER_AGENT_AUTH_TOKEN",
        &credentials_secret_name(dda),
        TOKEN_KEY,
    )
}

/// Env shared by every container talking to the Datadog intake.
fn common_env(dda: &DatadogAgent, log_level: Option<&String>) -> Vec<EnvVar> {
    let mut vars = vec![api_key_env(dda)];
    if let Some(cluster_name) = non_empty(dda.spec.cluster_name.as_ref()) {
        vars.push(env("DD_CLUSTER_NAME", cluster_name));
    }
    if let Some(site) = non_empty(dda.spec.site.as_ref()) {
        vars.push(env("DD_SITE", site));
    }
    if let Some(level) = non_empty(log_level) {
        vars.push(env("DD_LOG_LEVEL", level));
    }
    vars
}

fn cluster_agent_client_env(dda: &DatadogAgent) -> Vec<EnvVar> {
    vec![
        env("DD_CLUSTER_AGENT_ENABLED", "true"),
        env(
            "DD_CLUSTER_AGENT_KUBERNETES_SERVICE_NAME",
            cluster_agent_service_name(dda),
        ),
        auth_token_env(dda),
    ]
}

fn agent_env(dda: &DatadogAgent, agent: &DatadogAgentSpecAgentSpec) -> Vec<EnvVar> {
    let mut vars = common_env(dda, agent.config.log_level.as_ref());
    vars.push(field_env("DD_KUBERNETES_KUBELET_HOST", "status.hostIP"));
    if let Some(url) = non_empty(agent.config.dd_url.as_ref()) {
        vars.push(env("DD_DD_URL", url));
    }
    if !agent.config.tags.is_empty() {
        vars.push(env("DD_TAGS", agent.config.tags.join(" ")));
    }
    vars.push(env("DD_COLLECT_KUBERNETES_EVENTS", flag(agent.config.collect_events)));
    vars.push(env("DD_LEADER_ELECTION", flag(agent.config.leader_election)));
    vars.push(env("DD_LOGS_ENABLED", flag(agent.log.enabled)));
    vars.push(env(
        "DD_LOGS_CONFIG_CONTAINER_COLLECT_ALL",
        flag(agent.log.logs_config_container_collect_all),
    ));
    vars.push(env("DD_APM_ENABLED", flag(agent.apm.enabled)));
    vars.push(env("DD_PROCESS_AGENT_ENABLED", flag(agent.process.enabled)));
    vars.push(env("DD_SYSTEM_PROBE_ENABLED", flag(agent.system_probe.enabled)));

    if let Some(cluster_agent) = &dda.spec.cluster_agent {
        vars.extend(cluster_agent_client_env(dda));
        if cluster_agent.cluster_checks_enabled() {
            let providers = if cluster_checks_runner_enabled(dda) {
                "endpointschecks"
            } else {
                "clusterchecks endpointschecks"
            };
            vars.push(env("DD_EXTRA_CONFIG_PROVIDERS", providers));
        }
    }
    vars.extend(agent.config.env.iter().cloned());
    vars.extend(agent.env.iter().cloned());
    vars
}

fn cluster_agent_env(dda: &DatadogAgent, spec: &DatadogAgentSpecClusterAgentSpec) -> Vec<EnvVar> {
    let mut vars = common_env(dda, spec.config.log_level.as_ref());
    vars.extend(app_key_env(dda));
    vars.push(auth_token_env(dda));
    vars.push(env(
        "DD_CLUSTER_AGENT_KUBERNETES_SERVICE_NAME",
        cluster_agent_service_name(dda),
    ));
    vars.push(env("DD_LEADER_ELECTION", "true"));
    vars.push(env("DD_COLLECT_KUBERNETES_EVENTS", flag(spec.config.collect_events)));
    vars.push(env(
        "DD_CLUSTER_CHECKS_ENABLED",
        spec.cluster_checks_enabled().to_string(),
    ));
    if spec.cluster_checks_enabled() {
        vars.push(env("DD_EXTRA_CONFIG_PROVIDERS", "kube_endpoints kube_services"));
        vars.push(env("DD_EXTRA_LISTENERS", "kube_endpoints kube_services"));
    }
    if spec.metrics_provider_enabled() {
        vars.push(env("DD_EXTERNAL_METRICS_PROVIDER_ENABLED", "true"));
        vars.push(env(
            "DD_EXTERNAL_METRICS_PROVIDER_PORT",
            metrics_provider_port(spec).to_string(),
        ));
    }
    vars.extend(spec.config.env.iter().cloned());
    vars
}

fn cluster_checks_runner_env(
    dda: &DatadogAgent,
    spec: &DatadogAgentSpecClusterChecksRunnerSpec,
) -> Vec<EnvVar> {
    let mut vars = common_env(dda, spec.config.log_level.as_ref());
    vars.extend(cluster_agent_client_env(dda));
    vars.push(env("DD_EXTRA_CONFIG_PROVIDERS", "clusterchecks"));
    vars.push(env("DD_HEALTH_PORT", HEALTH_PORT.to_string()));
    vars.push(env("DD_CLC_RUNNER_ENABLED", "true"));
    vars.push(field_env("DD_CLC_RUNNER_HOST", "status.podIP"));
    vars.push(env("DD_ENABLE_METADATA_COLLECTION", "false"));
    vars.push(env("DD_APM_ENABLED", "false"));
    vars.push(env("DD_PROCESS_AGENT_ENABLED", "false"));
    vars.push(env("DD_LOGS_ENABLED", "false"));
    vars.extend(spec.config.env.iter().cloned());
    vars
}

pub fn metrics_provider_port(spec: &DatadogAgentSpecClusterAgentSpec) -> i32 {
    spec.config
        .metrics_provider_port
        .unwrap_or(DEFAULT_METRICS_PROVIDER_PORT)
}

// ── Pod template pieces ───────────────────────────────────────────────────────

fn http_probe(path: &str) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(HEALTH_PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(15),
        period_seconds: Some(15),
        timeout_seconds: Some(5),
        success_threshold: Some(1),
        failure_threshold: Some(6),
        ..Default::default()
    }
}

fn base_container(name: &str, image: &ImageConfig) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.name.clone()),
        image_pull_policy: image.pull_policy.clone(),
        ..Default::default()
    }
}

fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(read_only),
        ..Default::default()
    }
}

/// Volume and mount for a custom `datadog.yaml`, either the operator-managed
/// ConfigMap or one the user references.
fn custom_config_volume(
    dda: &DatadogAgent,
    component: Component,
    config: &CustomConfigSpec,
) -> Option<(Volume, VolumeMount)> {
    let (default_name, default_key) = custom_config_map(dda, component);
    let (name, key) = match (&config.config_map, &config.config_data) {
        (Some(cm), _) => (
            cm.name.clone(),
            cm.file_key
                .clone()
                .unwrap_or_else(|| default_key.to_string()),
        ),
        (None, Some(_)) => (default_name, default_key.to_string()),
        (None, None) => return None,
    };
    let volume = Volume {
        name: "customconfig".to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name,
            items: Some(vec![KeyToPath {
                key: key.clone(),
                path: default_key.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    let volume_mount = VolumeMount {
        name: "customconfig".to_string(),
        mount_path: format!("/etc/datadog-agent/{default_key}"),
        sub_path: Some(default_key.to_string()),
        read_only: Some(true),
        ..Default::default()
    };
    Some((volume, volume_mount))
}

fn non_empty_map(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    (!map.is_empty()).then(|| map.clone())
}

fn agent_pod_template(
    dda: &DatadogAgent,
    agent: &DatadogAgentSpecAgentSpec,
    selector: &LabelSelector,
) -> PodTemplateSpec {
    let mut labels = component_labels(dda, Component::Agent);
    labels.extend(agent.additional_labels.clone());
    merge_selector_labels(&mut labels, selector);

    let mut volumes = vec![
        host_path_volume("procdir", "/proc"),
        host_path_volume("cgroups", "/sys/fs/cgroup"),
        host_path_volume("runtimesocketdir", "/var/run"),
    ];
    let mut mounts = vec![
        mount("procdir", "/host/proc", true),
        mount("cgroups", "/host/sys/fs/cgroup", true),
        mount("runtimesocketdir", "/host/var/run", true),
    ];
    if let Some((volume, volume_mount)) = agent
        .custom_config
        .as_ref()
        .and_then(|c| custom_config_volume(dda, Component::Agent, c))
    {
        volumes.push(volume);
        mounts.push(volume_mount);
    }
    volumes.extend(agent.config.volumes.iter().cloned());
    mounts.extend(agent.config.volume_mounts.iter().cloned());

    let env = agent_env(dda, agent);

    let mut containers = vec![Container {
        command: Some(vec!["agent".into(), "run".into()]),
        env: Some(env.clone()),
        resources: agent.config.resources.clone(),
        volume_mounts: Some(mounts.clone()),
        ports: Some(vec![ContainerPort {
            name: Some("dogstatsdport".into()),
            container_port: 8125,
            protocol: Some("UDP".into()),
            ..Default::default()
        }]),
        liveness_probe: Some(http_probe("/live")),
        readiness_probe: Some(http_probe("/ready")),
        ..base_container("agent", &agent.image)
    }];

    if agent.apm.enabled == Some(true) {
        let mut apm_env = env.clone();
        apm_env.extend(agent.apm.env.iter().cloned());
        containers.push(Container {
            command: Some(vec![
                "trace-agent".into(),
                "--config=/etc/datadog-agent/datadog.yaml".into(),
            ]),
            env: Some(apm_env),
            resources: agent.apm.resources.clone(),
            ports: Some(vec![ContainerPort {
                name: Some("traceport".into()),
                container_port: 8126,
                host_port: agent.apm.host_port,
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            volume_mounts: Some(mounts.clone()),
            ..base_container("trace-agent", &agent.image)
        });
    }

    if agent.process.enabled == Some(true) {
        let mut process_env = env.clone();
        process_env.extend(agent.process.env.iter().cloned());
        containers.push(Container {
            command: Some(vec![
                "process-agent".into(),
                "-config=/etc/datadog-agent/datadog.yaml".into(),
            ]),
            env: Some(process_env),
            resources: agent.process.resources.clone(),
            volume_mounts: Some(mounts.clone()),
            ..base_container("process-agent", &agent.image)
        });
    }

    if agent.system_probe.enabled == Some(true) {
        let mut probe_env = env.clone();
        probe_env.extend(agent.system_probe.env.iter().cloned());
        containers.push(Container {
            command: Some(vec![
                "/opt/datadog-agent/embedded/bin/system-probe".into(),
                "--config=/etc/datadog-agent/system-probe.yaml".into(),
            ]),
            env: Some(probe_env),
            resources: agent.system_probe.resources.clone(),
            security_context: Some(SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            volume_mounts: Some(mounts),
            ..base_container("system-probe", &agent.image)
        });
    }

    PodTemplateSpec {
        metadata: Some(kube::api::ObjectMeta {
            labels: Some(labels),
            annotations: non_empty_map(&agent.additional_annotations),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            service_account_name: Some(service_account_name(dda, Component::Agent)),
            priority_class_name: agent.priority_class_name.clone(),
            host_network: agent.host_network.then_some(true),
            tolerations: (!agent.config.tolerations.is_empty())
                .then(|| agent.config.tolerations.clone()),
            image_pull_secrets: agent.image.pull_secrets.clone(),
            containers,
            volumes: Some(volumes),
            ..Default::default()
        }),
    }
}

fn workload_meta(
    dda: &DatadogAgent,
    name: &str,
    component: Component,
    additional: &BTreeMap<String, String>,
) -> kube::api::ObjectMeta {
    let mut labels = component_labels(dda, component);
    labels.extend(additional.clone());
    owned_meta(dda, name, labels)
}

// ── Node agent ────────────────────────────────────────────────────────────────

fn agent_digest_inputs<'a>(
    dda: &'a DatadogAgent,
    agent: &'a DatadogAgentSpecAgentSpec,
) -> AgentInputs<'a> {
    AgentInputs {
        agent,
        credentials: &dda.spec.credentials,
        cluster_name: dda.spec.cluster_name.as_deref(),
        site: dda.spec.site.as_deref(),
        cluster_agent_enabled: dda.spec.cluster_agent.is_some(),
        cluster_checks_runner_enabled: cluster_checks_runner_enabled(dda),
    }
}

/// Plain DaemonSet for the node agent.
pub fn agent_daemonset(dda: &DatadogAgent, selector: Option<&LabelSelector>) -> Result<Built<DaemonSet>> {
    let agent = agent_spec(dda)?;
    let selector = selector_or_default(selector, &identity_labels(dda, Component::Agent));
    let template = agent_pod_template(dda, agent, &selector);

    let strategy = agent.deployment_strategy.clone().unwrap_or_default();
    let strategy_type = strategy
        .update_strategy_type
        .unwrap_or_else(|| "RollingUpdate".to_string());
    let rolling_update = (strategy_type == "RollingUpdate").then(|| RollingUpdateDaemonSet {
        max_unavailable: strategy.rolling_update.max_unavailable.clone(),
        ..Default::default()
    });

    let mut ds = DaemonSet {
        metadata: workload_meta(
            dda,
            &agent_daemonset_name(dda),
            Component::Agent,
            &agent.additional_labels,
        ),
        spec: Some(DaemonSetSpec {
            selector,
            template,
            update_strategy: Some(DaemonSetUpdateStrategy {
                type_: Some(strategy_type),
                rolling_update,
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    let digest = hash::stamp(&mut ds.metadata, &agent_digest_inputs(dda, agent))?;
    Ok(Built { object: ds, digest })
}

/// Canary-capable ExtendedDaemonSet for the node agent.
pub fn agent_extended_daemonset(
    dda: &DatadogAgent,
    selector: Option<&LabelSelector>,
) -> Result<Built<ExtendedDaemonSet>> {
    let agent = agent_spec(dda)?;
    let selector = selector_or_default(selector, &identity_labels(dda, Component::Agent));
    let template = agent_pod_template(dda, agent, &selector);
    let strategy = agent.deployment_strategy.clone().unwrap_or_default();

    let mut eds = ExtendedDaemonSet::new(
        &agent_daemonset_name(dda),
        ExtendedDaemonSetSpec {
            selector: Some(selector),
            template,
            strategy: ExtendedDaemonSetSpecStrategy {
                rolling_update: ExtendedDaemonSetSpecStrategyRollingUpdate {
                    max_unavailable: strategy.rolling_update.max_unavailable,
                    max_pod_scheduler_failure: strategy.rolling_update.max_pod_scheduler_failure,
                    max_parallel_pod_creation: strategy.rolling_update.max_parallel_pod_creation,
                    slow_start_interval_duration: strategy
                        .rolling_update
                        .slow_start_interval_duration,
                    slow_start_additive_increase: strategy
                        .rolling_update
                        .slow_start_additive_increase,
                },
                canary: strategy.canary,
                reconcile_frequency: strategy.reconcile_frequency,
            },
        },
    );
    eds.metadata = workload_meta(
        dda,
        &agent_daemonset_name(dda),
        Component::Agent,
        &agent.additional_labels,
    );
    let digest = hash::stamp(&mut eds.metadata, &agent_digest_inputs(dda, agent))?;
    Ok(Built { object: eds, digest })
}

// ── Cluster agent ─────────────────────────────────────────────────────────────

pub fn cluster_agent_deployment(
    dda: &DatadogAgent,
    selector: Option<&LabelSelector>,
) -> Result<Built<Deployment>> {
    let spec = cluster_agent_spec(dda)?;
    let selector = selector_or_default(selector, &identity_labels(dda, Component::ClusterAgent));

    let mut labels = component_labels(dda, Component::ClusterAgent);
    labels.extend(spec.additional_labels.clone());
    merge_selector_labels(&mut labels, &selector);

    let mut ports = vec![ContainerPort {
        name: Some("agentport".into()),
        container_port: CLUSTER_AGENT_PORT,
        protocol: Some("TCP".into()),
        ..Default::default()
    }];
    if spec.metrics_provider_enabled() {
        ports.push(ContainerPort {
            name: Some("metricsapi".into()),
            container_port: metrics_provider_port(spec),
            protocol: Some("TCP".into()),
            ..Default::default()
        });
    }

    let mut volumes = spec.config.volumes.clone();
    let mut mounts = spec.config.volume_mounts.clone();
    if let Some((volume, volume_mount)) = spec
        .custom_config
        .as_ref()
        .and_then(|c| custom_config_volume(dda, Component::ClusterAgent, c))
    {
        volumes.push(volume);
        mounts.push(volume_mount);
    }

    let container = Container {
        env: Some(cluster_agent_env(dda, spec)),
        ports: Some(ports),
        resources: spec.config.resources.clone(),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        liveness_probe: Some(http_probe("/live")),
        readiness_probe: Some(http_probe("/ready")),
        ..base_container("cluster-agent", &spec.image)
    };

    let mut deployment = Deployment {
        metadata: workload_meta(
            dda,
            &cluster_agent_deployment_name(dda),
            Component::ClusterAgent,
            &spec.additional_labels,
        ),
        spec: Some(DeploymentSpec {
            replicas: spec.replicas,
            selector,
            template: PodTemplateSpec {
                metadata: Some(kube::api::ObjectMeta {
                    labels: Some(labels),
                    annotations: non_empty_map(&spec.additional_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(service_account_name(dda, Component::ClusterAgent)),
                    priority_class_name: spec.priority_class_name.clone(),
                    affinity: spec.affinity.clone(),
                    tolerations: (!spec.tolerations.is_empty()).then(|| spec.tolerations.clone()),
                    node_selector: non_empty_map(&spec.node_selector),
                    image_pull_secrets: spec.image.pull_secrets.clone(),
                    containers: vec![container],
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };
    let inputs = ClusterAgentInputs {
        cluster_agent: spec,
        credentials: &dda.spec.credentials,
        cluster_name: dda.spec.cluster_name.as_deref(),
        site: dda.spec.site.as_deref(),
    };
    let digest = hash::stamp(&mut deployment.metadata, &inputs)?;
    Ok(Built {
        object: deployment,
        digest,
    })
}

// ── Cluster checks runner ─────────────────────────────────────────────────────

pub fn cluster_checks_runner_deployment(
    dda: &DatadogAgent,
    selector: Option<&LabelSelector>,
) -> Result<Built<Deployment>> {
    let spec = cluster_checks_runner_spec(dda)?;
    let selector = selector_or_default(
        selector,
        &identity_labels(dda, Component::ClusterChecksRunner),
    );

    let mut labels = component_labels(dda, Component::ClusterChecksRunner);
    labels.extend(spec.additional_labels.clone());
    merge_selector_labels(&mut labels, &selector);

    let mut volumes = spec.config.volumes.clone();
    let mut mounts = spec.config.volume_mounts.clone();
    if let Some((volume, volume_mount)) = spec
        .custom_config
        .as_ref()
        .and_then(|c| custom_config_volume(dda, Component::ClusterChecksRunner, c))
    {
        volumes.push(volume);
        mounts.push(volume_mount);
    }

    let container = Container {
        env: Some(cluster_checks_runner_env(dda, spec)),
        resources: spec.config.resources.clone(),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        liveness_probe: Some(http_probe("/live")),
        readiness_probe: Some(http_probe("/ready")),
        ..base_container("cluster-checks-runner", &spec.image)
    };

    let mut deployment = Deployment {
        metadata: workload_meta(
            dda,
            &cluster_checks_runner_deployment_name(dda),
            Component::ClusterChecksRunner,
            &spec.additional_labels,
        ),
        spec: Some(DeploymentSpec {
            replicas: spec.replicas,
            selector,
            template: PodTemplateSpec {
                metadata: Some(kube::api::ObjectMeta {
                    labels: Some(labels),
                    annotations: non_empty_map(&spec.additional_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(service_account_name(
                        dda,
                        Component::ClusterChecksRunner,
                    )),
                    priority_class_name: spec.priority_class_name.clone(),
                    affinity: spec.affinity.clone(),
                    tolerations: (!spec.tolerations.is_empty()).then(|| spec.tolerations.clone()),
                    node_selector: non_empty_map(&spec.node_selector),
                    image_pull_secrets: spec.image.pull_secrets.clone(),
                    containers: vec![container],
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };
    let inputs = ClusterChecksRunnerInputs {
        cluster_checks_runner: spec,
        credentials: &dda.spec.credentials,
        cluster_name: dda.spec.cluster_name.as_deref(),
        site: dda.spec.site.as_deref(),
    };
    let digest = hash::stamp(&mut deployment.metadata, &inputs)?;
    Ok(Built {
        object: deployment,
        digest,
    })
}

// ── Services ──────────────────────────────────────────────────────────────────

fn cluster_agent_selector_service(
    dda: &DatadogAgent,
    name: &str,
    port: i32,
    target_port: i32,
) -> Result<Built<Service>> {
    let mut service = Service {
        metadata: owned_meta(dda, name, component_labels(dda, Component::ClusterAgent)),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(identity_labels(dda, Component::ClusterAgent)),
            ports: Some(vec![ServicePort {
                protocol: Some("TCP".to_string()),
                port,
                target_port: Some(IntOrString::Int(target_port)),
                ..Default::default()
            }]),
            session_affinity: Some("None".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };
    let digest = hash::stamp(&mut service.metadata, &service.spec)?;
    Ok(Built {
        object: service,
        digest,
    })
}

/// Service the node agents and runners use to reach the cluster agent.
pub fn cluster_agent_service(dda: &DatadogAgent) -> Result<Built<Service>> {
    cluster_agent_selector_service(
        dda,
        &cluster_agent_service_name(dda),
        CLUSTER_AGENT_PORT,
        CLUSTER_AGENT_PORT,
    )
}

/// Service backing the external metrics APIService.
pub fn metrics_server_service(dda: &DatadogAgent) -> Result<Built<Service>> {
    let spec = cluster_agent_spec(dda)?;
    cluster_agent_selector_service(
        dda,
        &metrics_server_service_name(dda),
        443,
        metrics_provider_port(spec),
    )
}

// ── Secret ────────────────────────────────────────────────────────────────────

/// Plain-text content of the credentials Secret. Empty when there is nothing
/// for the operator to store.
fn credentials_data(dda: &DatadogAgent) -> BTreeMap<String, String> {
    let creds = &dda.spec.credentials;
    let backend = creds.use_secret_backend == Some(true);
    let mut data = BTreeMap::new();
    if !backend && non_empty(creds.api_key_existing_secret.as_ref()).is_none() {
        if let Some(key) = non_empty(creds.api_key.as_ref()) {
            data.insert(API_KEY.to_string(), key.to_string());
        }
    }
    if !backend && non_empty(creds.app_key_existing_secret.as_ref()).is_none() {
        if let Some(key) = non_empty(creds.app_key.as_ref()) {
            data.insert(APP_KEY.to_string(), key.to_string());
        }
    }
    if dda.spec.cluster_agent.is_some() {
        if let Some(token) = dda.auth_token() {
            data.insert(TOKEN_KEY.to_string(), token.to_string());
        }
    }
    data
}

/// Credentials Secret, or `None` when nothing is left to store or no
/// component runs.
pub fn credentials_secret(dda: &DatadogAgent) -> Result<Option<Built<Secret>>> {
    let any_component = dda.spec.agent.is_some()
        || dda.spec.cluster_agent.is_some()
        || dda.spec.cluster_checks_runner.is_some();
    let data = credentials_data(dda);
    if !any_component || data.is_empty() {
        return Ok(None);
    }
    let labels = crate::helpers::default_labels(dda, &dda.name_any(), "");
    let mut secret = Secret {
        metadata: owned_meta(dda, &credentials_secret_name(dda), labels),
        type_: Some("Opaque".to_string()),
        data: Some(
            data.iter()
                .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    };
    let digest = hash::stamp(&mut secret.metadata, &data)?;
    Ok(Some(Built {
        object: secret,
        digest,
    }))
}

// ── Custom configuration ──────────────────────────────────────────────────────

fn inline_custom_config(dda: &DatadogAgent, component: Component) -> Option<&str> {
    let config = match component {
        Component::Agent => dda.spec.agent.as_ref().and_then(|a| a.custom_config.as_ref()),
        Component::ClusterAgent => dda
            .spec
            .cluster_agent
            .as_ref()
            .and_then(|c| c.custom_config.as_ref()),
        Component::ClusterChecksRunner => dda
            .spec
            .cluster_checks_runner
            .as_ref()
            .and_then(|c| c.custom_config.as_ref()),
    }?;
    // A ConfigMap reference wins over inline data.
    if config.config_map.is_some() {
        return None;
    }
    config.config_data.as_deref()
}

/// ConfigMap for a component's inline custom configuration. The content must
/// be a YAML mapping.
pub fn custom_config_configmap(
    dda: &DatadogAgent,
    component: Component,
) -> Result<Option<Built<ConfigMap>>> {
    let Some(data) = inline_custom_config(dda, component) else {
        return Ok(None);
    };
    serde_yaml::from_str::<serde_yaml::Mapping>(data)?;

    let (name, key) = custom_config_map(dda, component);
    let content = BTreeMap::from([(key.to_string(), data.to_string())]);
    let mut cm = ConfigMap {
        metadata: owned_meta(dda, &name, component_labels(dda, component)),
        data: Some(content.clone()),
        ..Default::default()
    };
    let digest = hash::stamp(&mut cm.metadata, &content)?;
    Ok(Some(Built { object: cm, digest }))
}

// ── PodDisruptionBudgets ──────────────────────────────────────────────────────

pub fn pod_disruption_budget(
    dda: &DatadogAgent,
    component: Component,
) -> Result<Built<PodDisruptionBudget>> {
    let mut pdb = PodDisruptionBudget {
        metadata: owned_meta(dda, &pdb_name(dda, component), component_labels(dda, component)),
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(1)),
            selector: Some(LabelSelector {
                match_labels: Some(identity_labels(dda, component)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    let digest = hash::stamp(&mut pdb.metadata, &pdb.spec)?;
    Ok(Built {
        object: pdb,
        digest,
    })
}

// ── RBAC ──────────────────────────────────────────────────────────────────────

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

fn rule(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(api_groups.iter().map(|s| s.to_string()).collect()),
        resources: Some(resources.iter().map(|s| s.to_string()).collect()),
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

fn named_rule(api_groups: &[&str], resources: &[&str], names: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        resource_names: Some(names.iter().map(|s| s.to_string()).collect()),
        ..rule(api_groups, resources, verbs)
    }
}

fn non_resource_rule(urls: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        non_resource_urls: Some(urls.iter().map(|s| s.to_string()).collect()),
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

const READ: &[&str] = &["get", "list", "watch"];

/// Rules the cluster-level event/metadata collection needs. Node agents get
/// them only when no cluster agent does the work for them.
fn cluster_collection_rules() -> Vec<PolicyRule> {
    vec![
        rule(
            &[""],
            &["services", "events", "endpoints", "pods", "nodes", "componentstatuses"],
            READ,
        ),
        rule(&["quota.openshift.io"], &["clusterresourcequotas"], &["get", "list"]),
        named_rule(&[""], &["configmaps"], &["datadogtoken"], &["get", "update"]),
        named_rule(&[""], &["configmaps"], &["datadog-leader-election"], &["get", "update"]),
        rule(&[""], &["configmaps"], &["create"]),
    ]
}

pub fn cluster_role_rules(dda: &DatadogAgent, component: Component) -> Vec<PolicyRule> {
    match component {
        Component::Agent => {
            let mut rules = vec![
                rule(
                    &[""],
                    &["nodes/metrics", "nodes/spec", "nodes/proxy", "nodes/stats"],
                    &["get"],
                ),
                non_resource_rule(&["/version", "/healthz", "/metrics"], &["get"]),
            ];
            if dda.spec.cluster_agent.is_none() {
                rules.extend(cluster_collection_rules());
            }
            rules
        }
        Component::ClusterAgent => {
            let mut rules = cluster_collection_rules();
            rules.push(rule(&[""], &["namespaces"], &["get"]));
            rules.push(rule(&[""], &["events"], &["create"]));
            rules.push(non_resource_rule(&["/version", "/healthz"], &["get"]));
            if dda
                .spec
                .cluster_agent
                .as_ref()
                .is_some_and(|c| c.metrics_provider_enabled())
            {
                rules.push(rule(&["autoscaling"], &["horizontalpodautoscalers"], READ));
            }
            rules
        }
        Component::ClusterChecksRunner => vec![
            rule(
                &[""],
                &["services", "events", "endpoints", "pods", "nodes", "componentstatuses"],
                READ,
            ),
            non_resource_rule(&["/version", "/healthz", "/metrics"], &["get"]),
        ],
    }
}

/// Namespaced rules: leader election for the cluster agent.
pub fn role_rules() -> Vec<PolicyRule> {
    vec![
        named_rule(&[""], &["configmaps"], &["datadog-leader-election"], &["get", "update"]),
        rule(&[""], &["configmaps"], &["create"]),
        rule(&["coordination.k8s.io"], &["leases"], &["get", "create", "update"]),
    ]
}

pub fn service_account(dda: &DatadogAgent, component: Component) -> ServiceAccount {
    ServiceAccount {
        metadata: owned_meta(
            dda,
            &service_account_name(dda, component),
            component_labels(dda, component),
        ),
        ..Default::default()
    }
}

pub fn cluster_role(dda: &DatadogAgent, component: Component) -> ClusterRole {
    ClusterRole {
        metadata: cluster_meta(
            &rbac_resources_name(dda, component),
            component_labels(dda, component),
        ),
        rules: Some(cluster_role_rules(dda, component)),
        ..Default::default()
    }
}

fn service_account_subject(dda: &DatadogAgent, component: Component) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: service_account_name(dda, component),
        namespace: dda.namespace(),
        ..Default::default()
    }
}

pub fn cluster_role_binding(dda: &DatadogAgent, component: Component) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: cluster_meta(
            &rbac_resources_name(dda, component),
            component_labels(dda, component),
        ),
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: rbac_resources_name(dda, component),
        },
        subjects: Some(vec![service_account_subject(dda, component)]),
    }
}

pub fn role(dda: &DatadogAgent, component: Component) -> Role {
    Role {
        metadata: owned_meta(
            dda,
            &rbac_resources_name(dda, component),
            component_labels(dda, component),
        ),
        rules: Some(role_rules()),
    }
}

pub fn role_binding(dda: &DatadogAgent, component: Component) -> RoleBinding {
    RoleBinding {
        metadata: owned_meta(
            dda,
            &rbac_resources_name(dda, component),
            component_labels(dda, component),
        ),
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "Role".to_string(),
            name: rbac_resources_name(dda, component),
        },
        subjects: Some(vec![service_account_subject(dda, component)]),
    }
}
