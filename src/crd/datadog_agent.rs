use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, LocalObjectReference, ResourceRequirements, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::extended_daemonset::ExtendedDaemonSetSpecStrategyCanary;

// ── Shared sub-types ──────────────────────────────────────────────────────────

/// Credentials shared by every component.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Name of a user-managed Secret holding `api_key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_existing_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_key_existing_secret: Option<String>,
    /// Token shared by the node agents and the cluster agent. Generated when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_secret_backend: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secrets: Option<Vec<LocalObjectReference>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RbacConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

impl RbacConfig {
    pub fn enabled(&self) -> bool {
        self.create.unwrap_or(false)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFileConfigMapSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_key: Option<String>,
}

/// Either inline YAML (stored by the operator in a ConfigMap) or a reference
/// to a ConfigMap the user manages.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CustomConfigSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigFileConfigMapSpec>,
}

// ── Node agent ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeAgentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dd_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collect_events: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_election: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSetRollingUpdateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pod_scheduler_failure: Option<IntOrString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_pod_creation: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slow_start_interval_duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slow_start_additive_increase: Option<IntOrString>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSetDeploymentStrategy {
    /// `RollingUpdate` or `OnDelete`; only used for the plain DaemonSet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_strategy_type: Option<String>,
    #[serde(default)]
    pub rolling_update: DaemonSetRollingUpdateSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary: Option<ExtendedDaemonSetSpecStrategyCanary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile_frequency: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApmSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_config_container_collect_all: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemProbeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// Node agent, run on every node as a DaemonSet or ExtendedDaemonSet.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatadogAgentSpecAgentSpec {
    /// Run as an ExtendedDaemonSet. Ignored unless the operator supports that kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_extended_daemonset: Option<bool>,
    pub image: ImageConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemonset_name: Option<String>,
    #[serde(default)]
    pub config: NodeAgentConfig,
    #[serde(default)]
    pub rbac: RbacConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_strategy: Option<DaemonSetDeploymentStrategy>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    #[serde(default)]
    pub host_network: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub apm: ApmSpec,
    #[serde(default)]
    pub log: LogSpec,
    #[serde(default)]
    pub process: ProcessSpec,
    #[serde(default)]
    pub system_probe: SystemProbeSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_config: Option<CustomConfigSpec>,
}

// ── Cluster agent ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAgentConfig {
    /// Serve external metrics to the HPA through a metrics-server Service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_provider_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_provider_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_checks_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collect_events: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatadogAgentSpecClusterAgentSpec {
    pub image: ImageConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,
    #[serde(default)]
    pub config: ClusterAgentConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_config: Option<CustomConfigSpec>,
    #[serde(default)]
    pub rbac: RbacConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

impl DatadogAgentSpecClusterAgentSpec {
    pub fn cluster_checks_enabled(&self) -> bool {
        self.config.cluster_checks_enabled.unwrap_or(false)
    }

    pub fn metrics_provider_enabled(&self) -> bool {
        self.config.metrics_provider_enabled.unwrap_or(false)
    }
}

// ── Cluster checks runner ─────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterChecksRunnerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatadogAgentSpecClusterChecksRunnerSpec {
    pub image: ImageConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,
    #[serde(default)]
    pub config: ClusterChecksRunnerConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_config: Option<CustomConfigSpec>,
    #[serde(default)]
    pub rbac: RbacConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

// ── CRD ───────────────────────────────────────────────────────────────────────

/// DatadogAgent describes a full agent fleet: node agents, the cluster agent
/// and the cluster checks runners. A missing component spec means the
/// component must not run.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "datadoghq.com",
    version = "v1alpha1",
    kind = "DatadogAgent",
    shortname = "dd",
    namespaced,
    status = "DatadogAgentStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name": "Active", "type": "string", "jsonPath": ".status.conditions[?(@.type=='Active')].status"}"#,
    printcolumn = r#"{"name": "Agent", "type": "string", "jsonPath": ".status.agent.status"}"#,
    printcolumn = r#"{"name": "Cluster-Agent", "type": "string", "jsonPath": ".status.clusterAgent.status"}"#,
    printcolumn = r#"{"name": "Cluster-Checks-Runner", "type": "string", "jsonPath": ".status.clusterChecksRunner.status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatadogAgentSpec {
    #[serde(default)]
    pub credentials: AgentCredentials,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<DatadogAgentSpecAgentSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_agent: Option<DatadogAgentSpecClusterAgentSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_checks_runner: Option<DatadogAgentSpecClusterChecksRunnerSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
}

// ── Status ────────────────────────────────────────────────────────────────────

/// Discrete convergence state of one component workload.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum AgentState {
    Progressing,
    Running,
    Updating,
    Canary,
    Failed,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Progressing => "Progressing",
            Self::Running => "Running",
            Self::Updating => "Updating",
            Self::Canary => "Canary",
            Self::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// Observed state of the node agent workload (plain or extended).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSetStatus {
    #[serde(default)]
    pub desired: i32,
    #[serde(default)]
    pub current: i32,
    #[serde(default)]
    pub ready: i32,
    #[serde(default)]
    pub available: i32,
    #[serde(default)]
    pub up_to_date: i32,
    /// `"<State> (<desired>/<ready>/<upToDate>)"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<AgentState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemonset_name: Option<String>,
}

/// Observed state of a Deployment-backed component.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub updated_replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub available_replicas: i32,
    #[serde(default)]
    pub unavailable_replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_hash: Option<String>,
    /// Cluster agent only: token generated when the user supplied none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<AgentState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum DatadogAgentConditionType {
    Active,
    ReconcileError,
}

impl std::fmt::Display for DatadogAgentConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "Active",
            Self::ReconcileError => "ReconcileError",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatadogAgentCondition {
    #[serde(rename = "type")]
    pub type_: DatadogAgentConditionType,
    /// `"True"` or `"False"`.
    pub status: String,
    pub last_transition_time: Time,
    pub last_update_time: Time,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatadogAgentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<DaemonSetStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_agent: Option<DeploymentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_checks_runner: Option<DeploymentStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<DatadogAgentCondition>,
}

impl DatadogAgentStatus {
    /// Token generated for the cluster agent, if any.
    pub fn generated_token(&self) -> Option<&str> {
        self.cluster_agent
            .as_ref()
            .and_then(|s| s.generated_token.as_deref())
            .filter(|t| !t.is_empty())
    }

    pub fn condition(&self, type_: DatadogAgentConditionType) -> Option<&DatadogAgentCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

impl DatadogAgent {
    /// Token the cluster agent and node agents authenticate with: the user's
    /// token when given, otherwise the generated one.
    pub fn auth_token(&self) -> Option<&str> {
        self.spec
            .credentials
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .or_else(|| self.status.as_ref().and_then(|s| s.generated_token()))
    }
}
