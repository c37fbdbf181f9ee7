//! Fleet node agent
//!
//! Runs on each hypervisor host:
//!
//! - **Heartbeat**: samples memory, load and bridge addresses every interval
//!   and writes them to the node document
//! - **Request rate**: publishes the trailing one-minute request count
//! - **Reconciler**: converges assigned VMs toward their declared state

use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_control_plane::InstanceService;
use fleet_events::BroadcastPublisher;
use fleet_networking::VpcAddressPool;
use fleet_node_agent::{
    Config, MockHypervisor, NodeDeps, NodeRuntime, Reconciler, ReconcilerConfig, ReconcilerDeps,
    RuntimeSettings, SystemMetrics,
};
use fleet_store::SqliteStore;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node_id = %config.node_id,
        data_dir = %config.data_dir.display(),
        bridge = %config.hypervisor.bridge_name,
        "Starting fleet node agent"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    let store = Arc::new(
        SqliteStore::open(config.database_path()).context("failed to open document store")?,
    );
    let publisher = Arc::new(BroadcastPublisher::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let node = NodeRuntime::init(
        config.node_id,
        NodeDeps {
            nodes: store.clone(),
            certificates: store.clone(),
            instances: store.clone(),
            metrics: Arc::new(SystemMetrics::new()),
            publisher: publisher.clone(),
        },
        RuntimeSettings {
            bridge_name: config.hypervisor.bridge_name.clone(),
            heartbeat_interval: config.heartbeat_interval,
        },
    )
    .await?;

    let registered = node.snapshot().await;
    for dir in [registered.virt_path(), registered.cache_path()] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let mut handles = node.start(shutdown_rx.clone());

    let service = Arc::new(InstanceService::new(
        store.clone(),
        Arc::new(VpcAddressPool::new()),
        publisher,
    ));
    let reconciler = Arc::new(Reconciler::new(
        config.node_id,
        registered.virt_path(),
        ReconcilerDeps {
            hypervisor: Arc::new(MockHypervisor::new()),
            instances: store.clone(),
            disks: store,
            service,
        },
        ReconcilerConfig {
            interval: config.reconcile_interval,
            start_timeout: config.hypervisor.start_timeout,
            stop_timeout: config.hypervisor.stop_timeout,
            ..ReconcilerConfig::default()
        },
    ));
    handles.push(reconciler.spawn(shutdown_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Background task panicked");
        }
    }

    info!("Node agent shutdown complete");
    Ok(())
}
