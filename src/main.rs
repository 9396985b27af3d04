use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};

use ikev2d::network::ike::daemon::{DaemonCommand, IkeDaemon};
use ikev2d::network::ike::kernel::LoggingKernel;
use ikev2d::IkeDaemonConfig;

#[derive(Parser)]
#[command(name = "ikev2d")]
#[command(about = "IKEv2 daemon core - authenticated key exchange and child SA negotiation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the IKE daemon in the foreground
    Start,
    /// Start the daemon and immediately initiate an IKE SA to `peer`
    Connect {
        /// Peer IPv4 address, must be present in the configured peer table
        peer: Ipv4Addr,
    },
    /// Start the daemon and immediately tear down the IKE SA to `peer`
    Disconnect {
        /// Peer IPv4 address
        peer: Ipv4Addr,
    },
    /// Show the loaded configuration
    Status,
    /// List configured peers
    Peers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Start => run_daemon(None).await?,
        Commands::Connect { peer } => run_daemon(Some(DaemonCommand::Connect(peer))).await?,
        Commands::Disconnect { peer } => run_daemon(Some(DaemonCommand::Disconnect(peer))).await?,
        Commands::Status => show_status()?,
        Commands::Peers => show_peers()?,
    }

    Ok(())
}

/// Binds the daemon and runs it until Ctrl-C, optionally pushing one command
/// onto its queue first (used by the `connect`/`disconnect` subcommands,
/// which have no separate running-daemon-plus-client split to talk to).
async fn run_daemon(initial_command: Option<DaemonCommand>) -> Result<()> {
    let config = IkeDaemonConfig::load()
        .map_err(|e| {
            error!("failed to load configuration: {e}");
            e
        })
        .context("loading daemon configuration")?;
    let peers = config
        .peer_configurations()
        .map_err(|e| {
            error!("invalid peer configuration: {e}");
            e
        })
        .context("validating peer configuration")?;

    info!(peers = peers.len(), "loaded ike configuration");

    let my_addr = config.my_addr().context("parsing listen_addr")?;
    let daemon = IkeDaemon::bind(my_addr, config.listen_port, peers, LoggingKernel)
        .await
        .context("binding ike listener")?;

    let (tx, rx) = mpsc::channel::<DaemonCommand>(16);
    if let Some(cmd) = initial_command {
        tx.send(cmd).await.ok();
    }
    drop(tx);

    tokio::select! {
        result = daemon.run(rx) => {
            result.context("ike daemon loop")?;
        }
        _ = signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }

    Ok(())
}

fn show_status() -> Result<()> {
    let config = IkeDaemonConfig::load().context("loading daemon configuration")?;
    println!("listen: {}:{}", config.listen_addr, config.listen_port);
    println!("log level: {}", config.log_level);
    println!("configured peers: {}", config.peers.len());
    Ok(())
}

fn show_peers() -> Result<()> {
    let config = IkeDaemonConfig::load().context("loading daemon configuration")?;
    if config.peers.is_empty() {
        println!("no peers configured");
        return Ok(());
    }
    println!("PEER");
    for addr in config.peers.keys() {
        println!("{addr}");
    }
    Ok(())
}
