//! ExtendedDaemonSet: the canary-capable node workload.
//!
//! The rollout engine for this kind runs in its own controller. This operator
//! only creates, updates and deletes these objects and reads their status, so
//! the types below carry just the fields it touches.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Strategy ──────────────────────────────────────────────────────────────────

/// Canary phase of a rollout.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedDaemonSetSpecStrategyCanary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<IntOrString>,
    /// Go-style duration, e.g. `10m`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<LabelSelector>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedDaemonSetSpecStrategyRollingUpdate {
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
pub struct ExtendedDaemonSetSpecStrategy {
    #[serde(default)]
    pub rolling_update: ExtendedDaemonSetSpecStrategyRollingUpdate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary: Option<ExtendedDaemonSetSpecStrategyCanary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile_frequency: Option<String>,
}

// ── CRD ───────────────────────────────────────────────────────────────────────

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "datadoghq.com",
    version = "v1alpha1",
    kind = "ExtendedDaemonSet",
    shortname = "eds",
    namespaced,
    status = "ExtendedDaemonSetStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name": "Desired", "type": "integer", "jsonPath": ".status.desired"}"#,
    printcolumn = r#"{"name": "Ready", "type": "integer", "jsonPath": ".status.ready"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedDaemonSetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    pub template: PodTemplateSpec,
    #[serde(default)]
    pub strategy: ExtendedDaemonSetSpecStrategy,
}

// ── Status ────────────────────────────────────────────────────────────────────

pub const STATE_CANARY_FAILED: &str = "Canary Failed";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedDaemonSetStatusCanary {
    pub replica_set: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedDaemonSetStatus {
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default)]
    pub active_replica_set: String,
    /// Present while a canary is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary: Option<ExtendedDaemonSetStatusCanary>,
}

impl ExtendedDaemonSetStatus {
    /// The rollout engine gave up on the current canary.
    pub fn is_failed(&self) -> bool {
        self.state.as_deref() == Some(STATE_CANARY_FAILED)
    }

    pub fn has_active_canary(&self) -> bool {
        self.canary.is_some()
    }
}
