//! nodeops controller - reconciles ManagedNode resources into running nodes

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Config as ControllerConfig;
use kube::{Api, Client, CustomResourceExt};
use tracing::{error, info, warn};

use nodeops::controller::{error_policy, evict_departed, node_controller, reconcile, Context};
use nodeops::crd::ManagedNode;
use nodeops::health::{self, Readiness};
use nodeops::leader::LeaderElector;
use nodeops::telemetry::{init_telemetry, TelemetryConfig};

/// nodeops - Kubernetes operator for Axelar blockchain nodes
#[derive(Parser, Debug)]
#[command(name = "nodeops", version, about, long_about = None)]
struct Cli {
    /// Print the ManagedNode CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Seconds between periodic reconciles of a healthy node
    #[arg(long, env = "NODEOPS_REQUEUE_INTERVAL_SECS", default_value_t = 300)]
    requeue_interval_secs: u64,

    /// Deadline in seconds for one node status poll
    #[arg(long, env = "NODEOPS_POLL_TIMEOUT_SECS", default_value_t = 5)]
    poll_timeout_secs: u64,

    /// Maximum number of nodes reconciled at once
    #[arg(long, env = "NODEOPS_CONCURRENCY", default_value_t = 4)]
    concurrency: u16,

    /// Only watch this namespace (default: all namespaces)
    #[arg(long, env = "NODEOPS_NAMESPACE")]
    namespace: Option<String>,

    /// Address for the /healthz and /readyz endpoints
    #[arg(long, env = "NODEOPS_PROBE_ADDR", default_value = "0.0.0.0:8081")]
    probe_addr: SocketAddr,

    /// Only reconcile while holding the leader Lease
    #[arg(long, env = "NODEOPS_LEADER_ELECT")]
    leader_elect: bool,

    /// Namespace holding the leader Lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "nodeops-system")]
    lease_namespace: String,

    /// Do not install or update the CRD on startup
    #[arg(long, env = "NODEOPS_SKIP_CRD_INSTALL")]
    skip_crd_install: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&ManagedNode::crd())
            .context("failed to serialize CRD")?;
        println!("{crd}");
        return Ok(());
    }

    let telemetry = init_telemetry(&TelemetryConfig::default())?;
    let result = run_controller(cli).await;
    if let Err(e) = &result {
        error!(error = %e, "Controller exited with error");
    }
    telemetry.shutdown();
    result
}

/// Install the ManagedNode CRD with server-side apply
///
/// Keeps the stored schema in step with the running binary.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("nodeops").force();
    let crd = ManagedNode::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();

    info!(crd = %name, "Installing CRD");
    crds.patch(&name, &params, &Patch::Apply(&crd))
        .await
        .with_context(|| format!("failed to install CRD {name}"))?;
    Ok(())
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    if !cli.skip_crd_install {
        ensure_crd_installed(&client).await?;
    }

    let readiness = Readiness::default();
    let probes = tokio::spawn(health::serve(cli.probe_addr, readiness.clone()));

    let mut leadership = if cli.leader_elect {
        let identity = std::env::var("POD_NAME")
            .context("POD_NAME must be set when leader election is enabled")?;
        let elector = LeaderElector::new(client.clone(), &cli.lease_namespace, &identity);
        Some(elector.acquire().await)
    } else {
        None
    };

    let ctx = Arc::new(
        Context::builder(client.clone())
            .requeue_interval(Duration::from_secs(cli.requeue_interval_secs))
            .poll_timeout(Duration::from_secs(cli.poll_timeout_secs))
            .build()?,
    );

    info!(
        namespace = cli.namespace.as_deref().unwrap_or("*"),
        concurrency = cli.concurrency,
        "Starting ManagedNode controller"
    );
    readiness.mark_ready();

    let controller = node_controller(client, cli.namespace.as_deref());
    let evictor = tokio::spawn(evict_departed(
        controller.store(),
        ctx.clone(),
        Duration::from_secs(cli.requeue_interval_secs.max(1)),
    ));

    let controller = controller
        .with_config(ControllerConfig::default().concurrency(cli.concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((node, _)) => {
                    tracing::debug!(node = %node.name, "Reconciled");
                }
                Err(e) => {
                    warn!(error = %e, "Reconcile failed");
                }
            }
        });

    let outcome = match leadership.as_mut() {
        Some(guard) => {
            tokio::select! {
                _ = controller => Ok(()),
                _ = guard.lost() => {
                    readiness.mark_not_ready();
                    Err(anyhow::anyhow!("lost leader lease"))
                }
            }
        }
        None => {
            controller.await;
            Ok(())
        }
    };

    if let Some(guard) = leadership {
        guard.release().await;
    }
    evictor.abort();
    probes.abort();
    info!("Controller stopped");
    outcome
}
