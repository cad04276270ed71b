//! Shared setup for the kind tests

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use shoal::accessor::ListScope;
use shoal::controller::{Context, Reconciler, CONTROLLER_NAME};
use shoal::crd::SearchCluster;
use shoal::labels::Selector;
use shoal::runtime::{kube_notifications, Manager, ManagerConfig};

const CRD_NAME: &str = "searchclusters.shoal.dev";

/// Connect to the current kubeconfig context and install the CRD
pub async fn ensure_test_cluster() -> Result<Client, String> {
    let client = Client::try_default()
        .await
        .map_err(|e| format!("no usable kubeconfig: {e}"))?;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    crds.patch(
        CRD_NAME,
        &PatchParams::apply(CONTROLLER_NAME).force(),
        &Patch::Apply(&SearchCluster::crd()),
    )
    .await
    .map_err(|e| format!("failed to install CRD: {e}"))?;

    // The API server needs a moment before it serves a fresh CRD
    wait_for("CRD to be served", Duration::from_secs(30), || {
        let api: Api<SearchCluster> = Api::all(client.clone());
        async move { api.list(&Default::default()).await.is_ok() }
    })
    .await?;

    Ok(client)
}

/// Create namespace `name` if it does not exist yet
pub async fn ensure_namespace(client: &Client, name: &str) -> Result<(), String> {
    let api: Api<Namespace> = Api::all(client.clone());
    if api.get_opt(name).await.map_err(|e| e.to_string())?.is_some() {
        return Ok(());
    }
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    api.create(&PostParams::default(), &ns)
        .await
        .map_err(|e| format!("failed to create namespace {name}: {e}"))?;
    Ok(())
}

/// Run the controller in-process for `namespace` until the token is cancelled
pub fn start_controller(client: &Client, namespace: &str) -> CancellationToken {
    let ctx = Arc::new(Context::builder(client.clone()).build());
    let clusters = ctx.clusters.clone();
    let reconciler = Arc::new(Reconciler::new(ctx));

    let managed = Selector::managed();
    let notifications = futures::stream::select_all(vec![
        kube_notifications(Api::<SearchCluster>::namespaced(client.clone(), namespace), None),
        kube_notifications(Api::<Pod>::namespaced(client.clone(), namespace), Some(&managed)),
        kube_notifications(Api::<Service>::namespaced(client.clone(), namespace), Some(&managed)),
        kube_notifications(Api::<Job>::namespaced(client.clone(), namespace), Some(&managed)),
    ])
    .boxed();

    let config = ManagerConfig {
        workers: 2,
        resync_interval: Duration::from_secs(10),
        shutdown_timeout: Duration::from_secs(5),
        scope: ListScope::namespace(namespace),
        ..ManagerConfig::default()
    };

    let shutdown = CancellationToken::new();
    let manager = Manager::new(config, reconciler, clusters);
    tokio::spawn(manager.run(notifications, shutdown.clone()));
    shutdown
}

/// Delete a SearchCluster and wait until it is gone
pub async fn cleanup_cluster(client: &Client, namespace: &str, name: &str) {
    let api: Api<SearchCluster> = Api::namespaced(client.clone(), namespace);
    let _ = api.delete(name, &DeleteParams::default()).await;
    let _ = wait_for("cluster deletion", Duration::from_secs(60), || {
        let api = api.clone();
        let name = name.to_string();
        async move { matches!(api.get_opt(&name).await, Ok(None)) }
    })
    .await;
}

/// Poll `check` every second until it holds or `timeout` passes
pub async fn wait_for<F, Fut>(what: &str, timeout: Duration, mut check: F) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            return Err(format!("timed out after {timeout:?} waiting for {what}"));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
