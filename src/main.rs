//! vlanman - Kubernetes operator for external VLAN-tagged L2 networks

use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vlanman::agent::{self, AgentConfig};
use vlanman::config::OperatorConfig;
use vlanman::controller::{self, Context, HttpManagerApi};
use vlanman::crd::VlanNetwork;
use vlanman::lock::{LeaseLock, Locker};
use vlanman::retry::PollBudget;
use vlanman::store::{KubeStore, Store};
use vlanman::webhook::{self, WebhookState};
use vlanman::{iface, worker, IPAM_LEASE_NAME};

/// vlanman - attach workload pods to external VLAN networks
#[derive(Parser, Debug)]
#[command(name = "vlanman", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reconciler and the admission webhook server
    Operator,

    /// Run the per-node manager agent (inside the manager DaemonSet)
    Manager,

    /// Run the worker init container (inside annotated pods)
    Worker,

    /// Run the one-shot VLAN interface creation job
    Interface,

    /// Print the VlanNetwork CRD manifest as YAML and exit
    Crd,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("failed to install crypto provider");

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Commands::Operator => run_operator().await,
        Commands::Manager => {
            let config = AgentConfig::from_env()?;
            agent::run(config).await?;
            Ok(())
        }
        Commands::Worker => {
            worker::run().await?;
            Ok(())
        }
        Commands::Interface => {
            iface::run().await?;
            Ok(())
        }
        Commands::Crd => {
            let crd = serde_yaml::to_string(&VlanNetwork::crd())
                .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {e}"))?;
            println!("{crd}");
            Ok(())
        }
    }
}

/// Run the controller and the webhook server in one process
async fn run_operator() -> anyhow::Result<()> {
    tracing::info!("vlanman operator starting");

    let config = OperatorConfig::from_env()?;
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    let identity = std::env::var("HOSTNAME")
        .unwrap_or_else(|_| format!("vlanman-operator-{}", std::process::id()));
    let locker: Arc<dyn Locker> = Arc::new(
        LeaseLock::new(client.clone(), &config.namespace, IPAM_LEASE_NAME, &identity).await?,
    );
    let store: Arc<dyn Store> = Arc::new(KubeStore::new(client.clone(), &config.namespace));

    let webhook_state = Arc::new(WebhookState {
        store: store.clone(),
        locker: locker.clone(),
        config: config.clone(),
    });
    let webhook_server = tokio::spawn(async move {
        if let Err(e) = webhook::serve(webhook_state).await {
            tracing::error!(error = %e, "webhook server exited");
        }
    });

    let ctx = Arc::new(Context {
        store,
        locker,
        manager_api: Arc::new(HttpManagerApi::new()),
        config,
        budget: PollBudget::default(),
    });
    controller::run(client, ctx).await?;

    webhook_server.abort();
    tracing::info!("vlanman operator shutting down");
    Ok(())
}
