//! Worker mode: runs once on a worker host.
//!
//! In this mode, the daemon:
//! 1. Optionally joins the local Docker engine to the swarm
//! 2. Builds the resource inventory, host facts included
//! 3. Resolves this host's identity (hostname + swarm node id)
//! 4. Announces itself to the manager, retrying with backoff

use std::path::PathBuf;

use anyhow::Context;
use tracing::info;

use swarmgrid_cluster::{AgentConfig, DockerClient, WorkerAgent};
use swarmgrid_state::WorkerIdentity;

/// Options of `gridd worker`.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub manager: String,
    pub nfs_root: Option<PathBuf>,
    pub join_token: Option<String>,
    pub swarm_addr: Option<String>,
    pub node_id: Option<String>,
    pub docker_socket: PathBuf,
    pub max_attempts: u32,
}

/// Run the worker.
pub async fn run_worker(opts: WorkerOptions) -> anyhow::Result<()> {
    info!(manager = %opts.manager, "SwarmGrid daemon starting in worker mode");
    let docker = DockerClient::new(&opts.docker_socket);

    // ── Swarm bootstrap ──────────────────────────────────────────
    if let (Some(token), Some(addr)) = (&opts.join_token, &opts.swarm_addr) {
        match docker.swarm_join(addr, token).await {
            Ok(()) => {}
            Err(e) if e.is_already_in_swarm() => info!("engine already part of a swarm"),
            Err(e) => return Err(e).context("joining swarm"),
        }
    }

    // ── Inventory ────────────────────────────────────────────────
    let nfs_root = opts.nfs_root.clone();
    let inventory =
        tokio::task::spawn_blocking(move || swarmgrid_inventory::build(nfs_root.as_deref()))
            .await?;

    // ── Identity ─────────────────────────────────────────────────
    let host = inventory
        .host
        .as_ref()
        .filter(|host| !host.hostname.is_empty())
        .context("cannot determine local hostname")?;
    info!(
        hostname = %host.hostname,
        os = %host.os,
        release = ?host.release,
        arch = %host.architecture,
        "host identified"
    );
    let hostname = host.hostname.clone();

    let node_id = match opts.node_id {
        Some(id) => id,
        None => docker
            .local_node_id()
            .await
            .context("resolving swarm node id (pass --node-id to skip)")?,
    };
    let identity = WorkerIdentity::new(hostname, node_id);
    info!(
        worker = %identity,
        cpus = inventory.cpu_count,
        ram_bytes = inventory.ram_bytes,
        gpus = ?inventory.gpu_ids(),
        nfs_root = ?inventory.nfs_root,
        "inventory collected"
    );

    // ── Join ─────────────────────────────────────────────────────
    let agent = WorkerAgent::new(AgentConfig {
        max_attempts: opts.max_attempts,
        ..AgentConfig::new(opts.manager)
    });
    let ack = agent.join(&identity, &inventory).await?;
    info!(worker = %identity, status = %ack.status, "worker registered");
    Ok(())
}
