//! THUNDER command-line node
//!
//! Lightning node core over TCP

mod config;
mod demo;
mod node;

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use config::{Config, PeerAddr};
use node::{Node, derive_node_id, load_seed};

const FRESHNESS_INTERVAL: Duration = Duration::from_secs(60);
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// THUNDER - Lightning node core
#[derive(Parser)]
#[command(name = "thunder")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node until interrupted
    Run {
        /// Listen address, overriding the config file
        #[arg(short, long)]
        listen: Option<String>,

        /// Extra peers to connect to, as node_id@host:port
        #[arg(long = "connect")]
        connect: Vec<PeerAddr>,
    },

    /// Run two nodes in-process: open a channel, pay over it and close it
    Demo {
        /// Channel size
        #[arg(long, default_value_t = 100_000)]
        channel_sat: u64,

        /// Payment amount
        #[arg(long, default_value_t = 5_000_000)]
        amount_msat: u64,
    },

    /// Generate the node seed
    Keygen {
        /// Replace an existing seed
        #[arg(long)]
        force: bool,
    },

    /// Print this node's id
    NodeId,

    /// Write the default configuration file
    Init,

    /// Show configuration and stored channel state
    Status,
}

#[derive(Serialize)]
struct Status {
    node_id: Option<String>,
    chain: String,
    listen_addr: String,
    peers: Vec<String>,
    data_dir: PathBuf,
    stored_monitors: Vec<String>,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path)?;
    config.validate()?;

    let level = if cli.verbose { "debug" } else { config.logging.level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run { listen, connect } => run_node(config, listen, connect).await?,
        Commands::Demo {
            channel_sat,
            amount_msat,
        } => {
            let dir = config.node.data_dir.join("demo");
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            let report = demo::run(&dir, config.channel, config.fees.sat_per_kw, channel_sat, amount_msat).await?;
            print_json(&report)?;
        }
        Commands::Keygen { force } => {
            let path = config.seed_path();
            if path.exists() {
                if !force {
                    anyhow::bail!("seed already exists at {} (use --force to replace it)", path.display());
                }
                std::fs::remove_file(&path)?;
            }
            load_seed(&path, true)?;
            print_node_id(&config)?;
        }
        Commands::NodeId => print_node_id(&config)?,
        Commands::Init => {
            if config_path.exists() {
                anyhow::bail!("{} already exists", config_path.display());
            }
            Config::default().save(&config_path)?;
            println!("Wrote {}", config_path.display());
        }
        Commands::Status => show_status(&config)?,
    }

    Ok(())
}

fn node_id(config: &Config) -> anyhow::Result<bitcoin::secp256k1::PublicKey> {
    let seed = load_seed(&config.seed_path(), false)?;
    derive_node_id(&seed, config.network()?)
}

fn print_node_id(config: &Config) -> anyhow::Result<()> {
    print_json(&serde_json::json!({ "node_id": node_id(config)?.to_string() }))
}

fn show_status(config: &Config) -> anyhow::Result<()> {
    let persister = thunder_core::chain::chain_monitor::FilesystemPersister::new(config.monitors_dir());
    let stored_monitors = persister
        .read_channel_monitors()?
        .into_iter()
        .map(|(funding_txo, _)| funding_txo.to_string())
        .collect();
    print_json(&Status {
        node_id: node_id(config).ok().map(|id| id.to_string()),
        chain: config.node.chain.clone(),
        listen_addr: config.network.listen_addr.clone(),
        peers: config.network.peers.clone(),
        data_dir: config.node.data_dir.clone(),
        stored_monitors,
    })
}

/// Run the node until Ctrl-C
async fn run_node(mut config: Config, listen: Option<String>, connect: Vec<PeerAddr>) -> anyhow::Result<()> {
    if let Some(listen) = listen {
        config.network.listen_addr = listen;
    }
    let listen_addr = config.parse_listen_addr()?;
    let mut peers = config.parse_peers()?;
    peers.extend(connect);

    let seed = load_seed(&config.seed_path(), true)?;
    let node = Node::new(
        &seed,
        config.network()?,
        config.channel,
        config.fees.sat_per_kw,
        &config.monitors_dir(),
        0,
    )?;
    tracing::info!(node_id = %node.node_id(), chain = %config.node.chain, "THUNDER node starting");
    tracing::warn!("no chain source attached; funding and closes are not confirmed on-chain");

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    let peer_manager = node.peer_manager.clone();
    let listener_task = tokio::spawn(async move {
        if let Err(e) = thunder_transport::listen(peer_manager, listener).await {
            tracing::error!(error = %e, "listener stopped");
        }
    });
    let timers = thunder_transport::spawn_timers(
        node.peer_manager.clone(),
        config.event_interval(),
        config.ping_interval(),
    );

    for peer in peers {
        match thunder_transport::connect_outbound(node.peer_manager.clone(), peer.node_id, peer.addr).await {
            Ok(_) => tracing::info!(%peer, "peer connected"),
            Err(e) => tracing::warn!(%peer, error = %e, "could not connect to peer"),
        }
    }

    let mut events = tokio::time::interval(config.event_interval());
    let mut freshness = tokio::time::interval(FRESHNESS_INTERVAL);
    let mut stale_sweep = tokio::time::interval(STALE_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = events.tick() => {
                node.handle_events();
            }
            _ = freshness.tick() => node.channel_manager.timer_chan_freshness_every_min(),
            _ = stale_sweep.tick() => {
                let removed = node.router.remove_stale_channels();
                if removed > 0 {
                    tracing::info!(removed, "pruned stale channels from the graph");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!(
        peers = node.peer_manager.get_peer_node_ids().len(),
        channels = node.channel_manager.list_channels().len(),
        "shutting down"
    );
    timers.abort();
    listener_task.abort();
    Ok(())
}
