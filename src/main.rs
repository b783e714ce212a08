//! cnat operator - run a command at a scheduled time, the Kubernetes way

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cnat::controller::{AtReconciler, Context};
use cnat::crd::At;
use cnat::engine::{Dispatcher, EngineConfig, WorkQueue};
use cnat::{inspect, notifier};

/// cnat - "cloud native at": schedule one-shot commands as Kubernetes resources
#[derive(Parser, Debug)]
#[command(name = "cnat", version, about, long_about = None)]
struct Cli {
    /// Generate the At CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller (default mode)
    Controller(ControllerArgs),

    /// List At resources and their phases
    List(ListArgs),
}

/// Controller mode arguments
#[derive(Args, Debug)]
struct ControllerArgs {
    /// Number of concurrent reconcile workers
    #[arg(long, env = "CNAT_WORKERS", default_value_t = cnat::DEFAULT_WORKERS)]
    workers: usize,

    /// Wall-clock budget for a single reconcile pass, in seconds
    #[arg(long, default_value_t = cnat::DEFAULT_RECONCILE_TIMEOUT_SECS)]
    reconcile_timeout_secs: u64,
}

/// List mode arguments
#[derive(Args, Debug)]
struct ListArgs {
    /// Path to an alternate kubeconfig (credentials) file
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<std::path::PathBuf>,

    /// Namespace to list from (all namespaces when omitted)
    #[arg(short, long)]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&At::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {e}"))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::List(args)) => {
            let client = inspect::build_client(args.kubeconfig.as_deref()).await?;
            inspect::run_list(client, args.namespace.as_deref()).await
        }
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => {
            run_controller(ControllerArgs {
                workers: cnat::DEFAULT_WORKERS,
                reconcile_timeout_secs: cnat::DEFAULT_RECONCILE_TIMEOUT_SECS,
            })
            .await
        }
    }
}

/// Run the controller: CRD install, watches, and the reconcile engine
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default().await?;

    ensure_crd_installed(&client).await?;

    let queue = Arc::new(WorkQueue::new());
    let ctx = Arc::new(Context::new(client.clone()));
    let reconciler = Arc::new(AtReconciler::new(ctx));

    let at_watch = tokio::spawn(notifier::run_at_watch(client.clone(), queue.clone()));
    let pod_watch = tokio::spawn(notifier::run_pod_watch(client.clone(), queue.clone()));

    let dispatcher = Dispatcher::new(
        queue.clone(),
        reconciler,
        EngineConfig {
            workers: args.workers,
            reconcile_timeout: Duration::from_secs(args.reconcile_timeout_secs),
        },
    );
    let engine = tokio::spawn(dispatcher.run());

    info!("controller started");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining workers");

    // Stop feeding the queue, then let in-flight reconciles finish
    at_watch.abort();
    pod_watch.abort();
    queue.shutdown();
    engine.await?;

    info!("controller stopped");
    Ok(())
}

/// Install (or update) the At CRD on startup via server-side apply
///
/// The operator owns its CRD so the schema always matches the binary.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Api, Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(cnat::FIELD_MANAGER).force();

    info!("installing At CRD");
    crds.patch(
        &format!("ats.{}", cnat::API_GROUP),
        &params,
        &Patch::Apply(&At::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to install At CRD: {e}"))?;

    Ok(())
}
