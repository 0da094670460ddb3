//! certwatch - Kubernetes secret certificate expiry monitor.
//!
//! Process bootstrap: flags, tracing, construction and wiring of the
//! informer, queue, workers, and the metrics listener, plus signal
//! handling. Everything else lives in the library modules.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, error, info};

use certwatch_common::observability;
use certwatch_monitor::config::MonitorConfig;
use certwatch_monitor::controller::Controller;
use certwatch_monitor::kube::informer::EventHandler;
use certwatch_monitor::kube::{ResolvedKubeConfig, SecretClient, SecretInformer, SecretStore};
use certwatch_monitor::metrics::{ControllerMetrics, ExpiryMetrics};
use certwatch_monitor::queue::WorkQueue;
use certwatch_monitor::server;

/// Exports certificate expiry metrics for Kubernetes secrets
#[derive(Parser, Debug)]
#[command(name = "certwatch", version, about)]
struct Cli {
    /// Path to a kubeconfig; only required out-of-cluster
    #[arg(long, env = "CERTWATCH_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Address to serve /metrics and health probes on
    #[arg(long, env = "CERTWATCH_LISTEN", default_value = "0.0.0.0:3000")]
    listen: SocketAddr,

    /// Watch a single namespace instead of the whole cluster
    #[arg(long, env = "CERTWATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Number of reconciliation workers
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Seconds between full re-deliveries of the cached secrets
    #[arg(long, default_value_t = 30)]
    resync_interval: u64,

    /// Prefix for exported metric names
    #[arg(long, default_value = "certwatch")]
    metrics_prefix: String,
}

impl Cli {
    fn into_config(self) -> MonitorConfig {
        MonitorConfig {
            kubeconfig: self.kubeconfig,
            listen: self.listen,
            namespace: self.namespace,
            workers: self.workers.max(1),
            resync_interval: Duration::from_secs(self.resync_interval.max(1)),
            metrics_prefix: self.metrics_prefix,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    observability::init_tracing()?;
    run(cli.into_config()).await
}

async fn run(config: MonitorConfig) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "certwatch starting");

    let registry = prometheus::Registry::new();
    let expiry = Arc::new(
        ExpiryMetrics::register(&config.metrics_prefix, &registry)
            .context("registering expiry metrics")?,
    );
    let controller_metrics = Arc::new(
        ControllerMetrics::register(&config.metrics_prefix, &registry)
            .context("registering controller metrics")?,
    );

    let kube_config = ResolvedKubeConfig::resolve(config.kubeconfig.as_deref())
        .context("resolving cluster connection configuration")?;
    let client = SecretClient::new(&kube_config, config.namespace.clone())
        .context("building secrets API client")?;

    let queue = WorkQueue::new();

    // Event bridge: change notifications become queue entries.
    let handler: EventHandler = {
        let queue = Arc::clone(&queue);
        let metrics = Arc::clone(&controller_metrics);
        Arc::new(move |key, reason| {
            debug!(key = %key, reason = %reason, "enqueueing secret for scan");
            queue.add(key, reason);
            metrics.set_queue_depth(queue.len());
        })
    };

    let informer = SecretInformer::new(client, config.resync_interval, handler);
    let store: Arc<dyn SecretStore> = Arc::new(informer.store());
    let mut synced = informer.synced();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_task = tokio::spawn(server::serve(
        config.listen,
        registry.clone(),
        informer.synced(),
        shutdown_rx.clone(),
    ));
    let informer_task = tokio::spawn(informer.run(shutdown_rx.clone()));

    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        });
    }

    // Workers must not run against an empty cache: wait for the first list
    // to land, unless we are told to stop first.
    let mut early_shutdown = shutdown_rx.clone();
    let ready = tokio::select! {
        result = synced.wait_for(|ready| *ready) => match result {
            Ok(_) => true,
            Err(_) => anyhow::bail!("informer stopped before the secret cache synced"),
        },
        _ = early_shutdown.wait_for(|stop| *stop) => false,
    };

    if ready {
        info!("secret cache synced, starting workers");
        let controller = Controller::new(
            Arc::clone(&queue),
            store,
            expiry,
            Arc::clone(&controller_metrics),
        );
        controller.run(config.workers, shutdown_rx.clone()).await;
    }

    let _ = informer_task.await;
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "metrics server failed"),
        Err(err) => error!(error = %err, "metrics server task panicked"),
    }

    info!("certwatch stopped");
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
