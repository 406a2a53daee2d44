//! gridd: the SwarmGrid daemon.
//!
//! One binary, two roles:
//! - `manager`: worker registry (redb), join API, swarm event reconciler
//! - `worker`: inventory discovery and join with retry
//!
//! # Usage
//!
//! ```text
//! gridd manager --port 8080 --data-dir /var/lib/swarmgrid
//! gridd worker --manager 10.0.0.1:8080 --nfs-root /mnt/nfs
//! ```

mod config;
mod manager;
mod worker;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::{GriddConfig, ManagerConfig, ManagerOverrides};
use crate::worker::WorkerOptions;

const DEFAULT_LOG_FILTER: &str = "info,gridd=debug,swarmgrid=debug";

#[derive(Parser)]
#[command(name = "gridd", about = "SwarmGrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the manager: join API, worker registry and reconciler.
    Manager {
        /// Address to listen on.
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for the worker registry.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Docker Engine socket.
        #[arg(long)]
        docker_socket: Option<PathBuf>,

        /// Optional gridd.toml; flags override its values.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Serve the API without following swarm node events.
        #[arg(long)]
        no_reconcile: bool,
    },

    /// Announce this host to a manager.
    Worker {
        /// Manager API address (`host:port`).
        #[arg(long)]
        manager: String,

        /// Shared NFS mount to advertise.
        #[arg(long)]
        nfs_root: Option<PathBuf>,

        /// Swarm join token; joins the swarm first when given with --swarm-addr.
        #[arg(long, requires = "swarm_addr")]
        join_token: Option<String>,

        /// Swarm manager address (`host:2377`).
        #[arg(long, requires = "join_token")]
        swarm_addr: Option<String>,

        /// Swarm node id; read from the local engine when omitted.
        #[arg(long)]
        node_id: Option<String>,

        /// Docker Engine socket.
        #[arg(long, default_value = swarmgrid_cluster::docker::DEFAULT_SOCKET)]
        docker_socket: PathBuf,

        /// Join attempts before giving up.
        #[arg(long, default_value = "10")]
        max_attempts: u32,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Manager {
            host,
            port,
            data_dir,
            docker_socket,
            config,
            no_reconcile,
        } => {
            let file = match config {
                Some(path) => GriddConfig::from_file(&path)?,
                None => GriddConfig::default(),
            };
            let overrides = ManagerOverrides {
                host,
                port,
                data_dir,
                docker_socket,
                no_reconcile,
            };
            manager::run_manager(ManagerConfig::resolve(overrides, file.manager)).await
        }
        Command::Worker {
            manager,
            nfs_root,
            join_token,
            swarm_addr,
            node_id,
            docker_socket,
            max_attempts,
        } => {
            worker::run_worker(WorkerOptions {
                manager,
                nfs_root,
                join_token,
                swarm_addr,
                node_id,
                docker_socket,
                max_attempts,
            })
            .await
        }
    }
}
