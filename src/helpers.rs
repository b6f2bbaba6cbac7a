use std::collections::BTreeMap;
use std::time::Duration;

use kube::api::ObjectMeta;
use kube::ResourceExt;
use rand::Rng;

use crate::crd::datadog_agent::DatadogAgent;

// ── Operator defaults (injected via CLI flags / env) ──────────────────────────

/// Images written into a DatadogAgent spec when the user leaves them empty.
#[derive(Clone, Debug)]
pub struct OperatorDefaults {
    pub agent_image: String,
    pub cluster_agent_image: String,
    pub cluster_checks_runner_image: String,
}

impl Default for OperatorDefaults {
    fn default() -> Self {
        Self {
            agent_image: "datadog/agent:latest".to_string(),
            cluster_agent_image: "datadog/cluster-agent:latest".to_string(),
            cluster_checks_runner_image: "datadog/agent:latest".to_string(),
        }
    }
}

/// Knobs that change how a reconcile pass behaves.
#[derive(Clone, Debug)]
pub struct ReconcilerOptions {
    /// The ExtendedDaemonSet CRD is installed and may be used for node agents.
    pub support_extended_daemonset: bool,
    /// Delay before the next pass when nothing asked for a specific one.
    pub requeue_period: Duration,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            support_extended_daemonset: false,
            requeue_period: Duration::from_secs(15),
        }
    }
}

// ── Components ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Component {
    Agent,
    ClusterAgent,
    ClusterChecksRunner,
}

impl Component {
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::ClusterAgent => "cluster-agent",
            Self::ClusterChecksRunner => "cluster-checks-runner",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}

// ── Labels ────────────────────────────────────────────────────────────────────

pub const OPERATOR_NAME: &str = "datadog-operator";

pub const LABEL_AGENT_NAME: &str = "agent.datadoghq.com/name";
pub const LABEL_AGENT_COMPONENT: &str = "agent.datadoghq.com/component";

pub const LABEL_APP_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_APP_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_APP_PART_OF: &str = "app.kubernetes.io/part-of";
pub const LABEL_APP_VERSION: &str = "app.kubernetes.io/version";
pub const LABEL_APP_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

const APP_NAME: &str = "datadog-agent-deployment";

/// `part-of` label value: cluster-scoped objects use it to find their owner.
pub fn part_of(dda: &DatadogAgent) -> String {
    format!("{}-{}", dda.namespace().unwrap_or_default(), dda.name_any())
}

/// Version reported in the `version` label.
///
/// Image tags are not resolved into agent versions, so this is always empty.
pub fn component_version(_dda: &DatadogAgent, _component: Component) -> String {
    String::new()
}

/// The `app.kubernetes.io/*` labels every managed object carries.
pub fn default_labels(dda: &DatadogAgent, instance: &str, version: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP_NAME.to_string(), APP_NAME.to_string()),
        (LABEL_APP_INSTANCE.to_string(), instance.to_string()),
        (LABEL_APP_PART_OF.to_string(), part_of(dda)),
        (LABEL_APP_VERSION.to_string(), version.to_string()),
        (LABEL_APP_MANAGED_BY.to_string(), OPERATOR_NAME.to_string()),
    ])
}

/// Identity labels used as the workload selector.
pub fn identity_labels(dda: &DatadogAgent, component: Component) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_AGENT_NAME.to_string(), dda.name_any()),
        (
            LABEL_AGENT_COMPONENT.to_string(),
            component.suffix().to_string(),
        ),
    ])
}

/// Full label set for an object belonging to `component`.
pub fn component_labels(dda: &DatadogAgent, component: Component) -> BTreeMap<String, String> {
    let mut labels = identity_labels(dda, component);
    labels.extend(default_labels(
        dda,
        component.suffix(),
        &component_version(dda, component),
    ));
    labels
}

/// Cluster-scoped objects cannot point at a namespaced owner, so ownership is
/// recorded in labels instead.
pub fn is_owned_by_labels(meta: &ObjectMeta, dda: &DatadogAgent) -> bool {
    let Some(labels) = meta.labels.as_ref() else {
        return false;
    };
    labels.get(LABEL_APP_MANAGED_BY).map(String::as_str) == Some(OPERATOR_NAME)
        && labels.get(LABEL_APP_PART_OF) == Some(&part_of(dda))
}

// ── Naming helpers ────────────────────────────────────────────────────────────

fn component_name(dda: &DatadogAgent, component: Component) -> String {
    format!("{}-{}", dda.name_any(), component.suffix())
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

pub fn agent_daemonset_name(dda: &DatadogAgent) -> String {
    dda.spec
        .agent
        .as_ref()
        .and_then(|a| non_empty(a.daemonset_name.as_ref()))
        .unwrap_or_else(|| component_name(dda, Component::Agent))
}

pub fn cluster_agent_deployment_name(dda: &DatadogAgent) -> String {
    dda.spec
        .cluster_agent
        .as_ref()
        .and_then(|c| non_empty(c.deployment_name.as_ref()))
        .unwrap_or_else(|| component_name(dda, Component::ClusterAgent))
}

pub fn cluster_checks_runner_deployment_name(dda: &DatadogAgent) -> String {
    dda.spec
        .cluster_checks_runner
        .as_ref()
        .and_then(|c| non_empty(c.deployment_name.as_ref()))
        .unwrap_or_else(|| component_name(dda, Component::ClusterChecksRunner))
}

/// Name of the ClusterRole / ClusterRoleBinding / Role / RoleBinding set of a component.
pub fn rbac_resources_name(dda: &DatadogAgent, component: Component) -> String {
    component_name(dda, component)
}

pub fn service_account_name(dda: &DatadogAgent, component: Component) -> String {
    let custom = match component {
        Component::Agent => dda
            .spec
            .agent
            .as_ref()
            .and_then(|a| a.rbac.service_account_name.as_ref()),
        Component::ClusterAgent => dda
            .spec
            .cluster_agent
            .as_ref()
            .and_then(|c| c.rbac.service_account_name.as_ref()),
        Component::ClusterChecksRunner => dda
            .spec
            .cluster_checks_runner
            .as_ref()
            .and_then(|c| c.rbac.service_account_name.as_ref()),
    };
    non_empty(custom).unwrap_or_else(|| component_name(dda, component))
}

/// Secret holding `api_key`, `app_key` and `token`.
pub fn credentials_secret_name(dda: &DatadogAgent) -> String {
    dda.name_any()
}

pub fn cluster_agent_service_name(dda: &DatadogAgent) -> String {
    component_name(dda, Component::ClusterAgent)
}

pub fn metrics_server_service_name(dda: &DatadogAgent) -> String {
    format!("{}-cluster-agent-metrics-server", dda.name_any())
}

pub fn pdb_name(dda: &DatadogAgent, component: Component) -> String {
    component_name(dda, component)
}

/// ConfigMap holding inline custom configuration, with the file name it is mounted as.
pub fn custom_config_map(dda: &DatadogAgent, component: Component) -> (String, &'static str) {
    match component {
        Component::Agent => (format!("{}-datadog-yaml", dda.name_any()), "datadog.yaml"),
        Component::ClusterAgent => (
            format!("{}-cluster-datadog-yaml", dda.name_any()),
            "datadog-cluster.yaml",
        ),
        Component::ClusterChecksRunner => (
            format!("{}-cluster-checks-runner-datadog-yaml", dda.name_any()),
            "datadog.yaml",
        ),
    }
}

// ── Token generation ──────────────────────────────────────────────────────────

pub const TOKEN_LENGTH: usize = 32;

const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Produces opaque tokens for the cluster agent.
pub trait TokenGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Letters drawn from the thread-local CSPRNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomTokenGenerator;

impl TokenGenerator for RandomTokenGenerator {
    fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..TOKEN_LENGTH)
            .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::datadog_agent::{DatadogAgentSpec, DatadogAgentSpecAgentSpec, RbacConfig};

    fn dda(spec: DatadogAgentSpec) -> DatadogAgent {
        let mut dda = DatadogAgent::new("foo", spec);
        dda.metadata.namespace = Some("bar".to_string());
        dda
    }

    #[test]
    fn names_follow_component_suffixes() {
        let d = dda(DatadogAgentSpec::default());
        assert_eq!(agent_daemonset_name(&d), "foo-agent");
        assert_eq!(cluster_agent_deployment_name(&d), "foo-cluster-agent");
        assert_eq!(
            cluster_checks_runner_deployment_name(&d),
            "foo-cluster-checks-runner"
        );
        assert_eq!(metrics_server_service_name(&d), "foo-cluster-agent-metrics-server");
        assert_eq!(credentials_secret_name(&d), "foo");
    }

    #[test]
    fn overrides_win_over_generated_names() {
        let d = dda(DatadogAgentSpec {
            agent: Some(DatadogAgentSpecAgentSpec {
                daemonset_name: Some("custom-ds".into()),
                rbac: RbacConfig {
                    create: Some(false),
                    service_account_name: Some("my-sa".into()),
                },
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(agent_daemonset_name(&d), "custom-ds");
        assert_eq!(service_account_name(&d, Component::Agent), "my-sa");
        assert_eq!(
            service_account_name(&d, Component::ClusterAgent),
            "foo-cluster-agent"
        );
    }

    #[test]
    fn empty_override_is_ignored() {
        let d = dda(DatadogAgentSpec {
            agent: Some(DatadogAgentSpecAgentSpec {
                daemonset_name: Some(String::new()),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(agent_daemonset_name(&d), "foo-agent");
    }

    #[test]
    fn component_labels_carry_identity_schema() {
        let d = dda(DatadogAgentSpec::default());
        let labels = component_labels(&d, Component::ClusterAgent);
        assert_eq!(labels[LABEL_AGENT_NAME], "foo");
        assert_eq!(labels[LABEL_AGENT_COMPONENT], "cluster-agent");
        assert_eq!(labels[LABEL_APP_PART_OF], "bar-foo");
        assert_eq!(labels[LABEL_APP_MANAGED_BY], "datadog-operator");
        assert_eq!(labels[LABEL_APP_VERSION], "");
    }

    #[test]
    fn label_ownership_requires_both_labels() {
        let d = dda(DatadogAgentSpec::default());
        let owned = ObjectMeta {
            labels: Some(default_labels(&d, "agent", "")),
            ..Default::default()
        };
        assert!(is_owned_by_labels(&owned, &d));

        let other = dda(DatadogAgentSpec::default());
        let mut foreign = owned.clone();
        foreign
            .labels
            .as_mut()
            .unwrap()
            .insert(LABEL_APP_PART_OF.into(), "other-foo".into());
        assert!(!is_owned_by_labels(&foreign, &other));
        assert!(!is_owned_by_labels(&ObjectMeta::default(), &d));
    }

    #[test]
    fn random_tokens_are_letters_of_fixed_length() {
        let t = RandomTokenGenerator.generate();
        assert_eq!(t.len(), TOKEN_LENGTH);
        assert!(t.chars().all(|c| c.is_ascii_alphabetic()));
        assert_ne!(t, RandomTokenGenerator.generate());
    }
}
