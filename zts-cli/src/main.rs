// zts: start in-process nodes on a fabric, exchange data over virtual sockets, print status.

mod config;
mod demo;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use zts_core::{rfc4193_address, sixplane_address, NetworkId, NodeId};

use crate::demo::Cluster;

#[derive(Parser, Debug)]
#[command(name = "zts", version, about = "Virtual sockets over an in-process overlay")]
struct Args {
    /// Base directory for node homes (default: a temporary directory).
    #[arg(long, env = "ZTS_HOME")]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Echo payloads between two nodes (default).
    Echo {
        #[arg(long, default_value_t = 3)]
        rounds: u32,
        /// Bytes per round; overrides the config file.
        #[arg(long)]
        size: Option<usize>,
    },
    /// Start nodes, print their networks and peers, then stop.
    Status {
        #[arg(long, default_value_t = 2)]
        nodes: usize,
    },
    /// Start nodes and keep them running until Ctrl+C or SIGTERM.
    Serve {
        #[arg(long, default_value_t = 2)]
        nodes: usize,
    },
    /// Print the RFC4193 and 6PLANE addresses of a node on a network.
    Addr {
        /// Network id, 16 hex digits.
        network: String,
        /// Node id, 10 hex digits.
        node: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let cfg = config::load()?;
    let home = args.home;

    match args.command.unwrap_or(Command::Echo { rounds: 3, size: None }) {
        Command::Echo { rounds, size } => {
            let size = size.unwrap_or(cfg.payload_size);
            let report = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
                let cluster = Cluster::start(&cfg, 2, home)?;
                let report = cluster.echo(cfg.echo_port, size, rounds)?;
                cluster.print_status()?;
                cluster.shutdown()?;
                Ok(report)
            })
            .await??;
            println!(
                "echo via {}: {} rounds, {} bytes in {:?}",
                report.server, report.rounds, report.bytes, report.elapsed
            );
        }
        Command::Status { nodes } => {
            tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
                let cluster = Cluster::start(&cfg, nodes, home)?;
                cluster.print_status()?;
                cluster.shutdown()
            })
            .await??;
        }
        Command::Serve { nodes } => {
            let cluster = tokio::task::spawn_blocking(move || Cluster::start(&cfg, nodes, home)).await??;
            info!(nodes, "nodes running, waiting for shutdown signal");
            shutdown_signal().await?;
            tokio::task::spawn_blocking(move || {
                cluster.print_status()?;
                cluster.shutdown()
            })
            .await??;
        }
        Command::Addr { network, node } => {
            let nwid: NetworkId = network.parse().context("network id")?;
            let node = u64::from_str_radix(node.trim_start_matches("0x"), 16)
                .ok()
                .filter(|n| *n <= NodeId::MASK)
                .map(NodeId)
                .context("node id must be at most 10 hex digits")?;
            println!("rfc4193 {}", rfc4193_address(nwid, node));
            println!("6plane  {}", sixplane_address(nwid, node));
        }
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
