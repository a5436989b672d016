mod app_status;
mod client;
mod controller;
mod events;
mod handlers;
mod metrics;
mod policy;
mod store;
mod submission;
mod submission_args;
#[cfg(test)]
mod testutil;
mod workqueue;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use prometheus::Registry;
use spark_application_crd::constants::{LABEL_LAUNCHED_BY_OPERATOR, LABEL_SPARK_ROLE};
use spark_application_crd::SparkApplication;
use tracing_subscriber::EnvFilter;

use crate::client::KubeApplicationClient;
use crate::controller::Controller;
use crate::events::KubeEventRecorder;
use crate::handlers::EventHandlers;
use crate::metrics::ApplicationMetrics;
use crate::store::{ApplicationStore, PodStore};
use crate::submission::KubeSubmissionJobManager;
use crate::workqueue::WorkQueue;

const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser)]
#[command(about = "Operator managing the lifecycle of Spark applications", version)]
struct Opts {
    /// Number of parallel reconciliation workers.
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u16).range(1..=10))]
    workers: u16,

    /// Namespace to watch; all namespaces when unset.
    #[arg(long)]
    namespace: Option<String>,

    /// Period of the periodic re-list in seconds.
    #[arg(long, default_value_t = 60)]
    resync_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opts = Opts::parse();
    let client = Client::try_default()
        .await
        .context("failed to initialize the cluster client")?;

    let registry = Registry::new();
    let metrics = ApplicationMetrics::new(&registry).context("failed to register metrics")?;

    let queue = WorkQueue::new();
    let apps = Arc::new(ApplicationStore::default());
    let pods = Arc::new(PodStore::default());
    let app_client = Arc::new(KubeApplicationClient::new(client.clone()));
    let job_manager = Arc::new(KubeSubmissionJobManager::new(client.clone()));
    let recorder = Arc::new(KubeEventRecorder::new(client.clone()));

    let controller = Arc::new(Controller::new(
        queue.clone(),
        apps.clone(),
        pods.clone(),
        app_client.clone(),
        job_manager,
        recorder.clone(),
        metrics,
    ));
    let handlers = Arc::new(EventHandlers::new(
        queue.clone(),
        apps.clone(),
        pods.clone(),
        app_client,
        recorder,
    ));

    let app_api: Api<SparkApplication> = match &opts.namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };
    let pod_api: Api<Pod> = match &opts.namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };

    tokio::spawn(watch_applications(app_api, handlers.clone(), apps.clone()));
    tokio::spawn(watch_pods(pod_api, handlers.clone(), pods.clone()));

    wait_for_cache_sync(&apps, &pods)
        .await
        .context("timed out waiting for caches to sync")?;
    tracing::info!(workers = opts.workers, "caches synced, starting workers");

    let mut workers = Vec::new();
    for _ in 0..opts.workers {
        workers.push(tokio::spawn(controller.clone().run_worker()));
    }

    let resync = {
        let handlers = handlers.clone();
        let period = Duration::from_secs(opts.resync_interval.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                handlers.resync();
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the shutdown signal")?;
    tracing::info!("shutting down, letting in-flight syncs finish");
    resync.abort();
    queue.shut_down();
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}

async fn watch_applications(
    api: Api<SparkApplication>,
    handlers: Arc<EventHandlers>,
    store: Arc<ApplicationStore>,
) {
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Init) => {}
            Ok(watcher::Event::InitApply(app)) | Ok(watcher::Event::Apply(app)) => {
                handlers.application_applied(app).await
            }
            Ok(watcher::Event::InitDone) => store.mark_synced(),
            Ok(watcher::Event::Delete(app)) => handlers.application_deleted(app).await,
            Err(error) => tracing::warn!(%error, "application watch interrupted"),
        }
    }
}

async fn watch_pods(api: Api<Pod>, handlers: Arc<EventHandlers>, store: Arc<PodStore>) {
    let selector = format!("{LABEL_LAUNCHED_BY_OPERATOR}=true,{LABEL_SPARK_ROLE}");
    let mut stream = watcher(api, watcher::Config::default().labels(&selector))
        .default_backoff()
        .boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Init) => {}
            Ok(watcher::Event::InitApply(pod)) | Ok(watcher::Event::Apply(pod)) => {
                handlers.pod_applied(pod)
            }
            Ok(watcher::Event::InitDone) => store.mark_synced(),
            Ok(watcher::Event::Delete(pod)) => handlers.pod_deleted(pod),
            Err(error) => tracing::warn!(%error, "pod watch interrupted"),
        }
    }
}

async fn wait_for_cache_sync(apps: &ApplicationStore, pods: &PodStore) -> anyhow::Result<()> {
    tokio::time::timeout(CACHE_SYNC_TIMEOUT, async {
        while !(apps.has_synced() && pods.has_synced()) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("caches did not sync within {CACHE_SYNC_TIMEOUT:?}"))
}
