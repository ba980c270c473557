//! bufmesh - Replicated buffer directory node
//!
//! Usage:
//!   bufmesh [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -n, --node-name <NAME> Node name (default: hostname)
//!   --channel <NAME>       Group channel to join
//!   --seeds <ADDR,...>     Gossip seed nodes
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::runtime::Handle;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use bufmesh::channel::GossipChannelFactory;
use bufmesh::cluster::CoordinatorRegistry;
use bufmesh::config::Config;
use bufmesh::directory::BufferDirectory;
use bufmesh::metrics::{Metrics, MetricsServer};
use bufmesh::replicator::Replicator;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// bufmesh - Replicated buffer directory node
#[derive(Parser, Debug)]
#[command(name = "bufmesh")]
#[command(version = "0.1.0")]
#[command(about = "Replicated buffer directory over gossip clustering")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node name (must be unique within the channel)
    #[arg(short, long)]
    node_name: Option<String>,

    /// Group channel to join
    #[arg(long)]
    channel: Option<String>,

    /// Gossip bind address
    #[arg(long)]
    gossip_addr: Option<SocketAddr>,

    /// Data link bind address
    #[arg(long)]
    data_addr: Option<SocketAddr>,

    /// Gossip seed nodes (host:port)
    #[arg(long, value_delimiter = ',')]
    seeds: Vec<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise use defaults
    let mut config = if let Some(config_path) = &args.config {
        match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    // Setup logging - CLI overrides config, config overrides default (info)
    let log_level = args.log_level.unwrap_or_else(|| {
        match config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // CLI args override file config
    if let Some(name) = args.node_name {
        config.node.name = Some(name);
    }
    if let Some(channel) = args.channel {
        config.node.channel = channel;
    }
    if let Some(addr) = args.gossip_addr {
        config.gossip.gossip_addr = addr;
    }
    if let Some(addr) = args.data_addr {
        config.gossip.data_addr = addr;
    }
    if !args.seeds.is_empty() {
        config.gossip.seeds = args.seeds;
    }
    config.validate().unwrap_or_else(|e| {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    });

    let node_name = config.node.get_node_name();

    info!("Starting bufmesh node");
    info!("  Node name: {}", node_name);
    info!("  Channel: {}", config.node.channel);
    info!("  Gossip address: {}", config.gossip.gossip_addr);
    info!("  Data address: {}", config.gossip.data_addr);
    if !config.gossip.seeds.is_empty() {
        info!("  Seeds: {}", config.gossip.seeds.join(", "));
    }
    info!("  Storage: {}", config.directory.storage_dir.display());

    let metrics = Metrics::new();

    // Join the channel over the gossip transport
    let factory = Arc::new(GossipChannelFactory::new(config.gossip.clone()));
    let registry = CoordinatorRegistry::new(factory, Handle::current(), metrics.clone())
        .with_probe_interval(config.node.probe_interval);

    let coordinator = match registry.join(&config.node.channel, &node_name).await {
        Ok(coordinator) => coordinator,
        Err(e) => {
            eprintln!("Error joining channel '{}': {}", config.node.channel, e);
            std::process::exit(1);
        }
    };

    // Stand up replication and the buffer directory on top of it
    let replicator = Replicator::new(coordinator);
    let directory = BufferDirectory::new(replicator, &config.directory).await?;
    info!(
        "  Directory replica: '{}' ({} entries)",
        config.directory.replica_key,
        directory.catalog_len()
    );

    // Setup metrics endpoint if configured
    if config.metrics.enabled {
        info!("  Metrics: enabled (http://{})", config.metrics.bind);
        let metrics_server = MetricsServer::new(metrics, config.metrics.bind);
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                error!("Metrics server error: {}", e);
            }
        });
    } else {
        info!("  Metrics: disabled");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if let Err(e) = directory.shutdown().await {
        error!("Error stopping directory replica: {}", e);
    }
    registry.shutdown_all().await;
    info!("Shutdown complete");

    Ok(())
}
