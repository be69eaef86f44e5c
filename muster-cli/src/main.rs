//! Muster CLI - run a membership node as a seed or joiner and watch the
//! cluster's view changes.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use muster_core::{Cluster, ClusterEvent, Endpoint, NodeStatusChange};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Scalable distributed membership node
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log filter (overridden by RUST_LOG)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap a new cluster with this node as the seed
    Start {
        /// Address to listen on, host:port
        #[arg(short, long, default_value = "127.0.0.1:7946")]
        listen: String,
    },

    /// Join an existing cluster through a seed node
    Join {
        /// Address to listen on, host:port
        #[arg(short, long, default_value = "127.0.0.1:0")]
        listen: String,

        /// Seed node to bootstrap from, host:port
        #[arg(short, long)]
        seed: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let cluster = match cli.command {
        Commands::Start { listen } => {
            let listen: Endpoint = listen.parse().context("invalid listen address")?;
            Cluster::builder(listen)
                .start()
                .await
                .context("failed to bootstrap cluster")?
        }
        Commands::Join { listen, seed } => {
            let listen: Endpoint = listen.parse().context("invalid listen address")?;
            let seed: Endpoint = seed.parse().context("invalid seed address")?;
            Cluster::builder(listen)
                .join(seed)
                .await
                .context("failed to join cluster")?
        }
    };

    info!(
        local = %cluster.local_endpoint(),
        members = cluster.member_list().len(),
        configuration = %cluster.configuration_id(),
        "node is up"
    );

    cluster.register_subscription(
        ClusterEvent::ViewChange,
        Arc::new(|changes: &[NodeStatusChange]| {
            for change in changes {
                info!(member = %change.endpoint, status = ?change.status, "view change");
            }
        }),
    );

    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutting down");
    cluster.shutdown().await;
    Ok(())
}
