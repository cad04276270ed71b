//! Shoal controller - reconciles SearchCluster resources

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use shoal::accessor::ListScope;
use shoal::controller::{Context, ReconcileConfig, Reconciler};
use shoal::crd::SearchCluster;
use shoal::desired::{RegistryImageResolver, DEFAULT_REGISTRY};
use shoal::labels::Selector;
use shoal::retry::RetryConfig;
use shoal::runtime::{kube_notifications, Manager, ManagerConfig, Notification};
use shoal::telemetry::{init_telemetry, TelemetryConfig};

/// Shoal - Kubernetes controller for clustered search services
#[derive(Parser, Debug)]
#[command(name = "shoal", version, about, long_about = None)]
struct Cli {
    /// Print the SearchCluster CRD and exit
    #[arg(long)]
    crd: bool,

    /// Only reconcile clusters in this namespace (default: all namespaces)
    #[arg(long, env = "SHOAL_NAMESPACE")]
    namespace: Option<String>,

    /// Number of concurrent reconciles
    #[arg(long, env = "SHOAL_WORKERS", default_value_t = shoal::DEFAULT_WORKERS)]
    workers: usize,

    /// Seconds between full resyncs
    #[arg(long, env = "SHOAL_RESYNC_SECS", default_value_t = shoal::DEFAULT_RESYNC_SECS)]
    resync_secs: u64,

    /// Seconds before a settling cluster is looked at again
    #[arg(long, env = "SHOAL_PROGRESS_SECS", default_value_t = shoal::DEFAULT_PROGRESS_SECS)]
    progress_secs: u64,

    /// Seconds in-flight reconciles get to finish on shutdown
    #[arg(long, default_value_t = shoal::DEFAULT_SHUTDOWN_TIMEOUT_SECS)]
    shutdown_timeout_secs: u64,

    /// Maximum number of clusters waiting in the work queue
    #[arg(long, default_value_t = shoal::DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Attempts for a conflicting write within one reconcile
    #[arg(long, default_value_t = shoal::DEFAULT_CONFLICT_RETRIES)]
    conflict_retries: u32,

    /// Registry worker images are pulled from, as `{registry}:{version}`
    #[arg(long, env = "SHOAL_IMAGE_REGISTRY", default_value = DEFAULT_REGISTRY)]
    image_registry: String,

    /// Log JSON lines instead of text
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn scope(&self) -> ListScope {
        match &self.namespace {
            Some(ns) => ListScope::namespace(ns),
            None => ListScope::All,
        }
    }

    fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            resync_interval: Duration::from_secs(self.resync_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            backoff: RetryConfig::queue_backoff(),
            scope: self.scope(),
        }
    }

    fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            conflict_retry: RetryConfig::conflict(self.conflict_retries),
            progress_interval: Duration::from_secs(self.progress_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - FIPS-validated aws-lc-rs
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install FIPS-validated crypto provider: {:?}. \
             The controller cannot talk to the API server without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&SearchCluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "shoal".to_string(),
        json: cli.log_json,
    })?;

    run_controller(cli).await
}

/// Install the CRD, then run the manager until a shutdown signal
async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    let ctx = Context::builder(client.clone())
        .images(Arc::new(RegistryImageResolver::new(&cli.image_registry)))
        .config(cli.reconcile_config())
        .build();
    let ctx = Arc::new(ctx);
    let clusters = ctx.clusters.clone();
    let reconciler = Arc::new(Reconciler::new(ctx));

    let scope = cli.scope();
    let notifications = watch_all(&client, &scope);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let manager = Manager::new(cli.manager_config(), reconciler, clusters);
    let drained = manager.run(notifications, shutdown).await;
    if !drained {
        tracing::warn!("some reconciles were abandoned during shutdown");
    }
    tracing::info!("shoal stopped");
    Ok(())
}

/// Ensure the SearchCluster CRD is installed
///
/// The controller installs its own CRD on startup using server-side apply,
/// so the schema always matches the controller version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(shoal::controller::CONTROLLER_NAME).force();

    tracing::info!("Installing SearchCluster CRD...");
    crds.patch(
        "searchclusters.shoal.dev",
        &params,
        &Patch::Apply(&SearchCluster::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install SearchCluster CRD: {}", e))?;

    tracing::info!("SearchCluster CRD installed/updated");
    Ok(())
}

fn api<K>(client: &Client, scope: &ListScope) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug,
{
    match scope {
        ListScope::All => Api::all(client.clone()),
        ListScope::Namespace(ns) => Api::namespaced(client.clone(), ns),
    }
}

/// One stream of notifications for clusters and everything shoal owns
fn watch_all(client: &Client, scope: &ListScope) -> BoxStream<'static, Notification> {
    let managed = Selector::managed();
    stream::select_all(vec![
        kube_notifications(api::<SearchCluster>(client, scope), None),
        kube_notifications(api::<Pod>(client, scope), Some(&managed)),
        kube_notifications(api::<Service>(client, scope), Some(&managed)),
        kube_notifications(api::<Job>(client, scope), Some(&managed)),
    ])
    .boxed()
}

/// Cancel `token` on SIGINT or SIGTERM
async fn shutdown_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
    token.cancel();
}
