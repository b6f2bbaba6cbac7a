//! datadog-operator: converges Datadog agent fleets from DatadogAgent resources.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::runtime::events::Reporter;
use kube::Client;
use tracing::info;
use warp::Filter;

use datadog_operator::controller::{self, client::KubeClusterClient};
use datadog_operator::helpers::{OperatorDefaults, RandomTokenGenerator, ReconcilerOptions};

#[derive(Parser, Debug)]
#[command(
    name = "datadog-operator",
    about = "Kubernetes operator for Datadog agents"
)]
struct Args {
    /// Run node agents as ExtendedDaemonSets when a resource asks for it.
    /// Requires the ExtendedDaemonSet CRD in the cluster.
    #[arg(long, default_value_t = false, env = "SUPPORT_EXTENDED_DAEMONSET")]
    supports_extended_daemonset: bool,

    /// Node agent image when spec.agent.image.name is empty.
    #[arg(long, default_value = "datadog/agent:latest", env = "DEFAULT_AGENT_IMAGE")]
    default_agent_image: String,

    /// Cluster agent image when spec.clusterAgent.image.name is empty.
    #[arg(
        long,
        default_value = "datadog/cluster-agent:latest",
        env = "DEFAULT_CLUSTER_AGENT_IMAGE"
    )]
    default_cluster_agent_image: String,

    /// Cluster checks runner image when spec.clusterChecksRunner.image.name is empty.
    #[arg(
        long,
        default_value = "datadog/agent:latest",
        env = "DEFAULT_CLUSTER_CHECKS_RUNNER_IMAGE"
    )]
    default_cluster_checks_runner_image: String,

    /// Seconds between passes when nothing asked for an earlier one.
    #[arg(long, default_value_t = 15, env = "REQUEUE_PERIOD_SECS")]
    requeue_period_secs: u64,

    /// Only watch this namespace. All namespaces when unset.
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Bind address for health probe endpoints (/healthz, /readyz).
    #[arg(long, default_value = ":8081", env = "HEALTH_PROBE_BIND_ADDRESS")]
    health_probe_bind_address: String,

    /// Log format: "text" for human-readable, "json" for structured.
    #[arg(long, default_value = "text", env = "LOG_FORMAT")]
    log_format: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,kube=warn,hyper=warn,tower=warn,warp=warn".into());

    if args.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let client = Client::try_default().await?;

    info!(
        extended_daemonset = args.supports_extended_daemonset,
        namespace = args.watch_namespace.as_deref().unwrap_or("*"),
        "starting datadog-operator"
    );

    let reporter = Reporter {
        controller: "datadog-operator".into(),
        instance: std::env::var("POD_NAME").ok(),
    };
    let ctx = Arc::new(controller::datadog_agent::Context {
        client: Arc::new(KubeClusterClient::new(client.clone(), reporter)),
        defaults: OperatorDefaults {
            agent_image: args.default_agent_image,
            cluster_agent_image: args.default_cluster_agent_image,
            cluster_checks_runner_image: args.default_cluster_checks_runner_image,
        },
        options: ReconcilerOptions {
            support_extended_daemonset: args.supports_extended_daemonset,
            requeue_period: Duration::from_secs(args.requeue_period_secs),
        },
        tokens: Arc::new(RandomTokenGenerator),
    });

    // Parse health probe bind address (e.g. ":8081" or "0.0.0.0:8081").
    let health_addr: std::net::SocketAddr = args
        .health_probe_bind_address
        .strip_prefix(':')
        .map(|port| format!("0.0.0.0:{port}"))
        .unwrap_or_else(|| args.health_probe_bind_address.clone())
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid --health-probe-bind-address: {e}"))?;

    let healthz = warp::get()
        .and(warp::path("healthz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));
    let readyz = warp::get()
        .and(warp::path("readyz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));
    let health_routes = healthz.or(readyz);

    tokio::select! {
        _ = controller::datadog_agent::run(client, ctx, args.watch_namespace) => {},
        _ = warp::serve(health_routes).run(health_addr) => {},
    }

    Ok(())
}
