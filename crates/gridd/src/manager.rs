//! Manager mode: serves the join API and reconciles the registry.
//!
//! In this mode, the daemon:
//! 1. Opens the worker registry under the data directory
//! 2. Subscribes to Docker node events and runs the reconciler
//! 3. Serves the REST API (join, workers, join tokens)
//! 4. On ctrl-c, stops the API and the reconciler

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use swarmgrid_api::JoinTokenSource;
use swarmgrid_cluster::{Backoff, DockerClient, Reconciler, RunExit};
use swarmgrid_state::WorkerRegistry;

use crate::config::ManagerConfig;

/// Node events buffered between the Docker stream and the reconciler.
const EVENT_BUFFER: usize = 256;

/// Run the manager.
pub async fn run_manager(config: ManagerConfig) -> anyhow::Result<()> {
    info!("SwarmGrid daemon starting in manager mode");
    std::fs::create_dir_all(&config.data_dir)?;

    // ── Registry ─────────────────────────────────────────────────
    let db_path = config.registry_path();
    let registry = WorkerRegistry::open(&db_path)?;
    info!(path = ?db_path, "worker registry opened");

    let docker = DockerClient::new(&config.docker_socket);

    // ── Reconciler ───────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconcile_handle = if config.reconcile {
        let registry = registry.clone();
        let docker = docker.clone();
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            reconcile_loop(registry, docker, shutdown).await;
        }))
    } else {
        warn!("reconciler disabled, registry will not follow swarm membership");
        None
    };

    // ── REST API server ──────────────────────────────────────────
    let tokens: Arc<dyn JoinTokenSource> = Arc::new(docker);
    let router = swarmgrid_api::build_router(registry, Some(tokens));

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!(addr = %listener.local_addr()?, "API server starting");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for ctrl-c");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    })
    .await?;

    if let Some(handle) = reconcile_handle {
        let _ = handle.await;
    }

    info!("manager stopped");
    Ok(())
}

/// Keep a reconciler attached to the Docker event stream.
///
/// Resubscribes with backoff whenever the stream cannot be opened or ends.
/// Events emitted while unsubscribed are not replayed.
async fn reconcile_loop(
    registry: WorkerRegistry,
    docker: DockerClient,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reconciler = Reconciler::new(registry);
    let mut backoff = new_backoff();

    loop {
        if *shutdown.borrow() {
            break;
        }

        match docker.subscribe_node_events(EVENT_BUFFER).await {
            Ok(events) => {
                backoff = new_backoff();
                if reconciler.run(events, shutdown.clone()).await == RunExit::Shutdown {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "cannot subscribe to node events"),
        }

        let delay = backoff.next_delay();
        info!(retry_in = ?delay, "resubscribing to node events");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!(tracked = reconciler.tracker().len(), "reconcile loop stopped");
}

fn new_backoff() -> Backoff {
    Backoff::new(Duration::from_secs(1), Duration::from_secs(60))
}
