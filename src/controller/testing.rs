//! In-memory cluster for multi-pass scenario tests of the controller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DeploymentStatus as ObservedDeploymentStatus;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::controller::Action;
use kube::ResourceExt;

use k8s_openapi::api::apps::v1::DaemonSet;

use crate::crd::datadog_agent::{
    AgentCredentials, AgentState, ClusterAgentConfig, CustomConfigSpec, DatadogAgent,
    DatadogAgentConditionType, DatadogAgentSpec, DatadogAgentSpecAgentSpec,
    DatadogAgentSpecClusterAgentSpec, DatadogAgentSpecClusterChecksRunnerSpec, ImageConfig,
};
use crate::error::{Error, Result};
use crate::helpers::{OperatorDefaults, ReconcilerOptions, TokenGenerator};

use super::client::{ClusterClient, EventInfo, ManagedObject, ObjectKind};
use super::datadog_agent::{reconcile_key, Context, CONFLICT_DELAY, NOT_READY_DELAY};
use super::defaults::apply_defaults;

const NS: &str = "bar";
const NAME: &str = "foo";
const TOKEN: &str = "0123456789abcdef0123456789abcdef";

#[derive(Clone, Debug, PartialEq, Eq)]
enum Call {
    Create(ObjectKind, String),
    Update(ObjectKind, String),
    Delete(ObjectKind, String),
    UpdateAgent,
    UpdateStatus,
}

impl Call {
    fn mutates_objects(&self) -> bool {
        matches!(self, Self::Create(..) | Self::Update(..) | Self::Delete(..))
    }
}

type Key = (ObjectKind, String, String);

#[derive(Default)]
struct State {
    agents: HashMap<(String, String), DatadogAgent>,
    objects: HashMap<Key, ManagedObject>,
    calls: Vec<Call>,
    events: Vec<EventInfo>,
    status_conflicts: usize,
    rejected_creates: Vec<ObjectKind>,
}

#[derive(Default)]
struct FakeCluster {
    state: Mutex<State>,
}

fn key(kind: ObjectKind, ns: &str, name: &str) -> Key {
    let ns = if kind.info().cluster_scoped { "" } else { ns };
    (kind, ns.to_string(), name.to_string())
}

impl FakeCluster {
    fn with_agent(dda: DatadogAgent) -> Arc<Self> {
        let fake = Self::default();
        fake.lock()
            .agents
            .insert((dda.namespace().unwrap_or_default(), dda.name_any()), dda);
        Arc::new(fake)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn agent(&self) -> DatadogAgent {
        self.lock().agents[&(NS.to_string(), NAME.to_string())].clone()
    }

    fn edit_agent(&self, edit: impl FnOnce(&mut DatadogAgent)) {
        let mut state = self.lock();
        let dda = state
            .agents
            .get_mut(&(NS.to_string(), NAME.to_string()))
            .unwrap();
        edit(dda);
    }

    fn object(&self, kind: ObjectKind, name: &str) -> Option<ManagedObject> {
        self.lock().objects.get(&key(kind, NS, name)).cloned()
    }

    fn count(&self, kind: ObjectKind) -> usize {
        self.lock().objects.keys().filter(|k| k.0 == kind).count()
    }

    fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    fn object_mutations_since(&self, mark: usize) -> Vec<Call> {
        self.lock().calls[mark..]
            .iter()
            .filter(|c| c.mutates_objects())
            .cloned()
            .collect()
    }

    fn insert(&self, obj: ManagedObject) {
        let k = key(obj.kind(), obj.namespace(), obj.name());
        self.lock().objects.insert(k, obj);
    }

    fn reject_creates(&self, kind: ObjectKind) {
        self.lock().rejected_creates.push(kind);
    }

    fn fail_status_updates(&self, times: usize) {
        self.lock().status_conflicts = times;
    }

    fn set_available(&self, name: &str, replicas: i32) {
        let mut state = self.lock();
        if let Some(ManagedObject::Deployment(d)) =
            state.objects.get_mut(&key(ObjectKind::Deployment, NS, name))
        {
            d.status = Some(ObservedDeploymentStatus {
                replicas: Some(replicas),
                ready_replicas: Some(replicas),
                updated_replicas: Some(replicas),
                available_replicas: Some(replicas),
                ..Default::default()
            });
        }
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_agent(&self, ns: &str, name: &str) -> Result<Option<DatadogAgent>> {
        Ok(self
            .lock()
            .agents
            .get(&(ns.to_string(), name.to_string()))
            .cloned())
    }

    async fn update_agent(&self, dda: &DatadogAgent) -> Result<DatadogAgent> {
        let mut state = self.lock();
        state.calls.push(Call::UpdateAgent);
        let k = (dda.namespace().unwrap_or_default(), dda.name_any());
        let Some(stored) = state.agents.get_mut(&k) else {
            return Err(Error::reconcile("agent not found"));
        };
        // The status sub-resource is not written through the main resource.
        let status = stored.status.clone();
        *stored = dda.clone();
        stored.status = status;
        let updated = stored.clone();
        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            state.agents.remove(&k);
        }
        Ok(updated)
    }

    async fn update_agent_status(&self, dda: &DatadogAgent) -> Result<DatadogAgent> {
        let mut state = self.lock();
        state.calls.push(Call::UpdateStatus);
        if state.status_conflicts > 0 {
            state.status_conflicts -= 1;
            return Err(Error::Conflict("the object has been modified".into()));
        }
        let k = (dda.namespace().unwrap_or_default(), dda.name_any());
        let Some(stored) = state.agents.get_mut(&k) else {
            return Err(Error::reconcile("agent not found"));
        };
        stored.status = dda.status.clone();
        Ok(stored.clone())
    }

    async fn get(&self, kind: ObjectKind, ns: &str, name: &str) -> Result<Option<ManagedObject>> {
        Ok(self.lock().objects.get(&key(kind, ns, name)).cloned())
    }

    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject> {
        let mut state = self.lock();
        let k = key(obj.kind(), obj.namespace(), obj.name());
        if state.objects.contains_key(&k) {
            return Err(Error::Conflict(format!("{} {} already exists", k.0, k.2)));
        }
        if state.rejected_creates.contains(&k.0) {
            return Err(Error::reconcile(format!("{} {} exceeds quota", k.0, k.2)));
        }
        state.calls.push(Call::Create(obj.kind(), obj.name().to_string()));
        state.objects.insert(k, obj.clone());
        Ok(obj.clone())
    }

    async fn update(&self, obj: &ManagedObject) -> Result<ManagedObject> {
        let mut state = self.lock();
        let k = key(obj.kind(), obj.namespace(), obj.name());
        let Some(stored) = state.objects.get_mut(&k) else {
            return Err(Error::reconcile(format!("{} {} not found", k.0, k.2)));
        };
        *stored = obj.clone();
        state.calls.push(Call::Update(obj.kind(), obj.name().to_string()));
        Ok(obj.clone())
    }

    async fn delete(&self, kind: ObjectKind, ns: &str, name: &str) -> Result<()> {
        let mut state = self.lock();
        if state.objects.remove(&key(kind, ns, name)).is_some() {
            state.calls.push(Call::Delete(kind, name.to_string()));
        }
        Ok(())
    }

    async fn publish_event(&self, _dda: &DatadogAgent, event: EventInfo) {
        self.lock().events.push(event);
    }
}

struct FixedToken;

impl TokenGenerator for FixedToken {
    fn generate(&self) -> String {
        TOKEN.to_string()
    }
}

fn context(fake: &Arc<FakeCluster>, support_extended_daemonset: bool) -> Context {
    Context {
        client: fake.clone(),
        defaults: OperatorDefaults::default(),
        options: ReconcilerOptions {
            support_extended_daemonset,
            ..Default::default()
        },
        tokens: Arc::new(FixedToken),
    }
}

fn agent_spec(image: &str) -> DatadogAgentSpecAgentSpec {
    DatadogAgentSpecAgentSpec {
        image: ImageConfig {
            name: image.to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn datadog_agent(spec: DatadogAgentSpec) -> DatadogAgent {
    let mut dda = DatadogAgent::new(NAME, spec);
    dda.metadata.namespace = Some(NS.to_string());
    dda.metadata.uid = Some("uid-foo".to_string());
    dda
}

fn agent_only() -> DatadogAgent {
    datadog_agent(DatadogAgentSpec {
        agent: Some(agent_spec("agent:6.14.0")),
        ..Default::default()
    })
}

/// Every component enabled, with the optional dependencies turned on.
fn full_spec() -> DatadogAgent {
    let mut agent = agent_spec("agent:6.14.0");
    agent.custom_config = Some(CustomConfigSpec {
        config_data: Some("logs_enabled: true\n".into()),
        ..Default::default()
    });
    datadog_agent(DatadogAgentSpec {
        credentials: AgentCredentials {
            api_key: Some("api-key".into()),
            app_key: Some("app-key".into()),
            ..Default::default()
        },
        agent: Some(agent),
        cluster_agent: Some(DatadogAgentSpecClusterAgentSpec {
            replicas: Some(2),
            config: ClusterAgentConfig {
                metrics_provider_enabled: Some(true),
                cluster_checks_enabled: Some(true),
                ..Default::default()
            },
            ..Default::default()
        }),
        cluster_checks_runner: Some(DatadogAgentSpecClusterChecksRunnerSpec::default()),
        ..Default::default()
    })
}

async fn pass(ctx: &Context) -> Result<Action> {
    reconcile_key(ctx, NS, NAME).await
}

/// Run passes until one neither writes nor asks for an immediate requeue.
async fn settle(ctx: &Context, fake: &FakeCluster) -> Action {
    for _ in 0..50 {
        let mark = fake.calls().len();
        let action = pass(ctx).await.expect("pass failed");
        let wrote = fake.calls()[mark..]
            .iter()
            .any(|c| c.mutates_objects() || *c == Call::UpdateAgent);
        if !wrote && action != Action::requeue(Duration::ZERO) {
            return action;
        }
    }
    panic!("reconciliation did not settle");
}

/// Settle while marking the cluster agent available after every round, so
/// the components behind its readiness gate get reconciled too.
async fn settle_with_ready_cluster_agent(ctx: &Context, fake: &FakeCluster) -> Action {
    for _ in 0..5 {
        settle(ctx, fake).await;
        fake.set_available("foo-cluster-agent", 2);
    }
    settle(ctx, fake).await
}

fn annotation_hash(obj: &ManagedObject) -> String {
    super::hash::stamped(obj.meta()).unwrap().to_string()
}

#[tokio::test]
async fn missing_resource_awaits_change() {
    let fake = Arc::new(FakeCluster::default());
    let ctx = context(&fake, false);
    assert_eq!(pass(&ctx).await.unwrap(), Action::await_change());
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn finalizer_then_defaults_are_persisted_first() {
    let fake = FakeCluster::with_agent(agent_only());
    let ctx = context(&fake, false);

    assert_eq!(pass(&ctx).await.unwrap(), Action::requeue(Duration::ZERO));
    assert!(fake.agent().finalizers().iter().any(|f| f == "finalizer.agent.datadoghq.com"));

    assert_eq!(pass(&ctx).await.unwrap(), Action::requeue(Duration::ZERO));
    let agent = fake.agent().spec.agent.unwrap();
    assert_eq!(agent.image.name, "agent:6.14.0");
    assert_eq!(agent.image.pull_policy.as_deref(), Some("IfNotPresent"));

    assert_eq!(fake.calls(), vec![Call::UpdateAgent, Call::UpdateAgent]);
}

#[tokio::test]
async fn minimal_agent_creates_one_daemonset_then_stays_quiet() {
    let fake = FakeCluster::with_agent(agent_only());
    let ctx = context(&fake, false);
    settle(&ctx, &fake).await;

    assert_eq!(fake.count(ObjectKind::DaemonSet), 1);
    assert_eq!(fake.count(ObjectKind::ExtendedDaemonSet), 0);
    assert_eq!(fake.count(ObjectKind::Deployment), 0);
    let ds = fake.object(ObjectKind::DaemonSet, "foo-agent").unwrap();
    let digest = annotation_hash(&ds);

    let status = fake.agent().status.unwrap();
    let agent_status = status.agent.as_ref().unwrap();
    assert_eq!(agent_status.current_hash.as_deref(), Some(digest.as_str()));
    assert_eq!(agent_status.daemonset_name.as_deref(), Some("foo-agent"));
    let active = status.condition(DatadogAgentConditionType::Active).unwrap();
    assert_eq!(active.status, "True");
    assert!(status.condition(DatadogAgentConditionType::ReconcileError).is_none());

    let mark = fake.calls().len();
    let action = pass(&ctx).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(15)));
    assert!(fake.object_mutations_since(mark).is_empty());
}

#[tokio::test]
async fn image_bump_updates_the_daemonset_once() {
    let fake = FakeCluster::with_agent(agent_only());
    let ctx = context(&fake, false);
    settle(&ctx, &fake).await;
    let before = annotation_hash(&fake.object(ObjectKind::DaemonSet, "foo-agent").unwrap());

    fake.edit_agent(|dda| {
        dda.spec.agent.as_mut().unwrap().image.name = "agent:6.15.0".into();
    });
    let mark = fake.calls().len();
    let action = pass(&ctx).await.unwrap();

    assert_eq!(action, Action::requeue(super::agent::UPDATE_DELAY));
    assert_eq!(
        fake.object_mutations_since(mark),
        vec![Call::Update(ObjectKind::DaemonSet, "foo-agent".into())]
    );
    let after = annotation_hash(&fake.object(ObjectKind::DaemonSet, "foo-agent").unwrap());
    assert_ne!(before, after);
    let status = fake.agent().status.unwrap();
    assert_eq!(
        status.agent.unwrap().current_hash.as_deref(),
        Some(after.as_str())
    );
}

#[tokio::test]
async fn switching_to_extended_daemonset_never_runs_both() {
    let fake = FakeCluster::with_agent(agent_only());
    let ctx = context(&fake, true);
    settle(&ctx, &fake).await;
    assert_eq!(fake.count(ObjectKind::DaemonSet), 1);

    fake.edit_agent(|dda| {
        dda.spec.agent.as_mut().unwrap().use_extended_daemonset = Some(true);
    });
    let action = pass(&ctx).await.unwrap();
    assert_eq!(action, Action::requeue(super::agent::MIGRATION_DELAY));
    assert_eq!(fake.count(ObjectKind::DaemonSet), 0);
    assert_eq!(fake.count(ObjectKind::ExtendedDaemonSet), 0);

    for _ in 0..5 {
        pass(&ctx).await.unwrap();
        assert!(fake.count(ObjectKind::DaemonSet) + fake.count(ObjectKind::ExtendedDaemonSet) <= 1);
    }
    assert_eq!(fake.count(ObjectKind::ExtendedDaemonSet), 1);

    fake.edit_agent(|dda| {
        dda.spec.agent.as_mut().unwrap().use_extended_daemonset = Some(false);
    });
    let action = pass(&ctx).await.unwrap();
    assert_eq!(action, Action::requeue(super::agent::MIGRATION_DELAY));
    settle(&ctx, &fake).await;
    assert_eq!(fake.count(ObjectKind::DaemonSet), 1);
    assert_eq!(fake.count(ObjectKind::ExtendedDaemonSet), 0);
}

#[tokio::test]
async fn extended_daemonset_is_ignored_without_cluster_support() {
    let mut dda = agent_only();
    dda.spec.agent.as_mut().unwrap().use_extended_daemonset = Some(true);
    let fake = FakeCluster::with_agent(dda);
    let ctx = context(&fake, false);
    settle(&ctx, &fake).await;
    assert_eq!(fake.count(ObjectKind::DaemonSet), 1);
    assert_eq!(fake.count(ObjectKind::ExtendedDaemonSet), 0);
}

#[tokio::test]
async fn removing_the_agent_spec_tears_everything_down() {
    let fake = FakeCluster::with_agent(agent_only());
    let ctx = context(&fake, false);
    settle(&ctx, &fake).await;
    assert_eq!(fake.count(ObjectKind::ServiceAccount), 1);
    assert_eq!(fake.count(ObjectKind::ClusterRole), 1);

    fake.edit_agent(|dda| dda.spec.agent = None);
    settle(&ctx, &fake).await;

    assert_eq!(fake.count(ObjectKind::DaemonSet), 0);
    assert_eq!(fake.count(ObjectKind::ServiceAccount), 0);
    assert_eq!(fake.count(ObjectKind::ClusterRole), 0);
    assert_eq!(fake.count(ObjectKind::ClusterRoleBinding), 0);
    assert!(fake.agent().status.unwrap().agent.is_none());
}

#[tokio::test]
async fn renaming_the_daemonset_is_rejected_without_mutation() {
    let fake = FakeCluster::with_agent(agent_only());
    let ctx = context(&fake, false);
    settle(&ctx, &fake).await;

    fake.edit_agent(|dda| {
        dda.spec.agent.as_mut().unwrap().daemonset_name = Some("renamed".into());
    });
    let mark = fake.calls().len();
    let err = pass(&ctx).await.unwrap_err();

    assert!(err.is_configuration());
    assert!(fake.object_mutations_since(mark).is_empty());
    assert!(fake.object(ObjectKind::DaemonSet, "foo-agent").is_some());
    let status = fake.agent().status.unwrap();
    let error = status
        .condition(DatadogAgentConditionType::ReconcileError)
        .unwrap();
    assert_eq!(error.status, "True");
    assert!(error.message.as_deref().unwrap().contains("renamed"));
    let active = status.condition(DatadogAgentConditionType::Active).unwrap();
    assert_eq!(active.status, "False");
}

#[tokio::test]
async fn cluster_agent_token_is_generated_before_the_deployment() {
    let fake = FakeCluster::with_agent(datadog_agent(DatadogAgentSpec {
        cluster_agent: Some(DatadogAgentSpecClusterAgentSpec::default()),
        ..Default::default()
    }));
    let ctx = context(&fake, false);

    // finalizer, defaults
    pass(&ctx).await.unwrap();
    pass(&ctx).await.unwrap();

    let mark = fake.calls().len();
    let action = pass(&ctx).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::ZERO));
    assert!(fake.object_mutations_since(mark).is_empty());
    assert_eq!(fake.calls()[mark..], [Call::UpdateStatus]);
    assert_eq!(fake.agent().status.unwrap().generated_token(), Some(TOKEN));

    let action = settle(&ctx, &fake).await;
    assert_eq!(action, Action::requeue(NOT_READY_DELAY));

    let Some(ManagedObject::Secret(secret)) = fake.object(ObjectKind::Secret, NAME) else {
        panic!("credentials secret missing");
    };
    assert_eq!(secret.data.unwrap()["token"].0, TOKEN.as_bytes().to_vec());

    let Some(ManagedObject::Deployment(deployment)) =
        fake.object(ObjectKind::Deployment, "foo-cluster-agent")
    else {
        panic!("cluster agent deployment missing");
    };
    let container = &deployment.spec.unwrap().template.spec.unwrap().containers[0];
    let token = container
        .env
        .as_ref()
        .unwrap()
        .iter()
        .find(|e| e.name == "DD_CLUSTER_AGENT_AUTH_TOKEN")
        .unwrap();
    let secret_ref = token
        .value_from
        .as_ref()
        .unwrap()
        .secret_key_ref
        .as_ref()
        .unwrap();
    assert_eq!(secret_ref.name, NAME);
    assert_eq!(secret_ref.key, "token");
    assert_eq!(fake.count(ObjectKind::Service), 1);
    assert_eq!(fake.count(ObjectKind::Role), 1);
}

#[tokio::test]
async fn unavailable_cluster_agent_is_reported_until_ready() {
    let fake = FakeCluster::with_agent(datadog_agent(DatadogAgentSpec {
        cluster_agent: Some(DatadogAgentSpecClusterAgentSpec::default()),
        ..Default::default()
    }));
    let ctx = context(&fake, false);
    settle(&ctx, &fake).await;

    let status = fake.agent().status.unwrap();
    let error = status
        .condition(DatadogAgentConditionType::ReconcileError)
        .unwrap();
    assert_eq!(error.status, "True");
    assert!(error.message.as_deref().unwrap().contains("0 pods available"));

    fake.set_available("foo-cluster-agent", 1);
    let action = pass(&ctx).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(15)));

    let status = fake.agent().status.unwrap();
    let error = status
        .condition(DatadogAgentConditionType::ReconcileError)
        .unwrap();
    assert_eq!(error.status, "False");
    let active = status.condition(DatadogAgentConditionType::Active).unwrap();
    assert_eq!(active.status, "True");
    let cluster_agent = status.cluster_agent.unwrap();
    assert_eq!(cluster_agent.available_replicas, 1);
    assert_eq!(cluster_agent.generated_token.as_deref(), Some(TOKEN));
}

#[tokio::test]
async fn status_conflict_requeues_shortly_without_error() {
    let fake = FakeCluster::with_agent(agent_only());
    let ctx = context(&fake, false);
    settle(&ctx, &fake).await;

    fake.edit_agent(|dda| dda.status.as_mut().unwrap().conditions.clear());
    fake.fail_status_updates(1);
    let action = pass(&ctx).await.unwrap();

    assert_eq!(action, Action::requeue(CONFLICT_DELAY));
    assert!(fake.agent().status.unwrap().conditions.is_empty());

    pass(&ctx).await.unwrap();
    assert!(!fake.agent().status.unwrap().conditions.is_empty());
}

#[tokio::test]
async fn deletion_removes_cluster_rbac_and_releases_the_finalizer() {
    let fake = FakeCluster::with_agent(agent_only());
    let ctx = context(&fake, false);
    settle(&ctx, &fake).await;
    assert_eq!(fake.count(ObjectKind::ClusterRoleBinding), 1);

    fake.edit_agent(|dda| {
        dda.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    });
    let action = pass(&ctx).await.unwrap();

    assert_eq!(action, Action::await_change());
    assert_eq!(fake.count(ObjectKind::ClusterRole), 0);
    assert_eq!(fake.count(ObjectKind::ClusterRoleBinding), 0);
    assert!(fake.lock().agents.is_empty());
    assert!(fake
        .lock()
        .events
        .iter()
        .any(|e| e.kind == ObjectKind::ClusterRole && e.name == "foo-agent"));
}

#[tokio::test]
async fn settled_full_spec_makes_no_further_writes() {
    let fake = FakeCluster::with_agent(full_spec());
    let ctx = context(&fake, false);
    settle_with_ready_cluster_agent(&ctx, &fake).await;

    assert_eq!(fake.count(ObjectKind::DaemonSet), 1);
    assert_eq!(fake.count(ObjectKind::Deployment), 2);
    assert_eq!(fake.count(ObjectKind::Service), 2);
    assert_eq!(fake.count(ObjectKind::ConfigMap), 1);
    assert_eq!(fake.count(ObjectKind::PodDisruptionBudget), 2);
    assert_eq!(fake.count(ObjectKind::Secret), 1);
    assert_eq!(fake.count(ObjectKind::ServiceAccount), 3);
    assert_eq!(fake.count(ObjectKind::ClusterRoleBinding), 3);

    let mark = fake.calls().len();
    let action = pass(&ctx).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(15)));
    assert!(fake.object_mutations_since(mark).is_empty());
    assert!(!fake.calls()[mark..].contains(&Call::UpdateAgent));

    let stored = fake.agent();
    let mut reloaded: DatadogAgent =
        serde_json::from_value(serde_json::to_value(&stored).unwrap()).unwrap();
    assert!(!apply_defaults(&mut reloaded.spec, &OperatorDefaults::default()));
}

#[tokio::test]
async fn removing_the_cluster_agent_tears_down_its_objects_and_the_runner() {
    let fake = FakeCluster::with_agent(full_spec());
    let ctx = context(&fake, false);
    settle_with_ready_cluster_agent(&ctx, &fake).await;
    assert!(fake.agent().status.unwrap().cluster_checks_runner.is_some());

    fake.edit_agent(|dda| dda.spec.cluster_agent = None);
    settle(&ctx, &fake).await;

    assert_eq!(fake.count(ObjectKind::Deployment), 0);
    assert_eq!(fake.count(ObjectKind::Service), 0);
    assert_eq!(fake.count(ObjectKind::PodDisruptionBudget), 0);
    assert_eq!(fake.count(ObjectKind::Role), 0);
    assert_eq!(fake.count(ObjectKind::RoleBinding), 0);
    assert!(fake.object(ObjectKind::ClusterRole, "foo-cluster-agent").is_none());
    assert!(fake.object(ObjectKind::ClusterRole, "foo-cluster-checks-runner").is_none());
    assert!(fake.object(ObjectKind::ServiceAccount, "foo-cluster-agent").is_none());
    // The node agent keeps running.
    assert_eq!(fake.count(ObjectKind::DaemonSet), 1);
    assert!(fake.object(ObjectKind::ClusterRole, "foo-agent").is_some());

    let status = fake.agent().status.unwrap();
    assert!(status.cluster_agent.is_none());
    assert!(status.cluster_checks_runner.is_none());
    assert!(status.agent.is_some());
}

#[tokio::test]
async fn removing_the_runner_keeps_the_cluster_agent() {
    let fake = FakeCluster::with_agent(full_spec());
    let ctx = context(&fake, false);
    settle_with_ready_cluster_agent(&ctx, &fake).await;
    assert!(fake.object(ObjectKind::Deployment, "foo-cluster-checks-runner").is_some());

    fake.edit_agent(|dda| dda.spec.cluster_checks_runner = None);
    settle_with_ready_cluster_agent(&ctx, &fake).await;

    assert!(fake.object(ObjectKind::Deployment, "foo-cluster-checks-runner").is_none());
    assert!(fake
        .object(ObjectKind::PodDisruptionBudget, "foo-cluster-checks-runner")
        .is_none());
    assert!(fake.object(ObjectKind::ClusterRole, "foo-cluster-checks-runner").is_none());
    assert!(fake.object(ObjectKind::Deployment, "foo-cluster-agent").is_some());
    assert!(fake
        .object(ObjectKind::PodDisruptionBudget, "foo-cluster-agent")
        .is_some());

    let status = fake.agent().status.unwrap();
    assert!(status.cluster_checks_runner.is_none());
    assert!(status.cluster_agent.is_some());
}

#[tokio::test]
async fn teardown_leaves_a_foreign_daemonset_alone() {
    let fake = FakeCluster::with_agent(datadog_agent(DatadogAgentSpec::default()));
    let mut foreign = DaemonSet::default();
    foreign.metadata.name = Some("foo-agent".into());
    foreign.metadata.namespace = Some(NS.into());
    fake.insert(ManagedObject::from(foreign));
    let ctx = context(&fake, false);

    settle(&ctx, &fake).await;

    assert!(fake.object(ObjectKind::DaemonSet, "foo-agent").is_some());
    assert!(!fake
        .calls()
        .contains(&Call::Delete(ObjectKind::DaemonSet, "foo-agent".into())));
    assert!(fake.agent().status.unwrap().agent.is_none());
}

#[tokio::test]
async fn failed_extended_daemonset_create_marks_the_agent_failed() {
    let mut dda = agent_only();
    dda.spec.agent.as_mut().unwrap().use_extended_daemonset = Some(true);
    let fake = FakeCluster::with_agent(dda);
    fake.reject_creates(ObjectKind::ExtendedDaemonSet);
    let ctx = context(&fake, true);

    let mut failure = None;
    for _ in 0..20 {
        if let Err(e) = pass(&ctx).await {
            failure = Some(e);
            break;
        }
    }
    let err = failure.expect("the create never failed");
    assert!(err.to_string().contains("exceeds quota"));

    let status = fake.agent().status.unwrap();
    assert_eq!(status.agent.as_ref().unwrap().state, Some(AgentState::Failed));
    let error = status
        .condition(DatadogAgentConditionType::ReconcileError)
        .unwrap();
    assert_eq!(error.status, "True");
    assert_eq!(fake.count(ObjectKind::ExtendedDaemonSet), 0);
}
