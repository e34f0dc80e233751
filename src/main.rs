//! ShardStor node
//!
//! Runs one storage node of an erasure-coded object store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          shardstor serve                          │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  hyper RPC server ──▶ Shard Store │ Metadata Replica              │
//! │  heartbeat sender ──▶ registry host                               │
//! │                                                                   │
//! │  --registry-host only:                                            │
//! │  Node Registry │ Healing Manager │ gateway (/objects/{b}/{k})     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use shardstor::adapters::{
    CompositeEventPublisher, HttpConnector, HttpMetadataClient, HttpRegistryClient,
    LoggingEventPublisher,
};
use shardstor::config::EngineConfig;
use shardstor::domain::{EventPublisher, MetadataService, NodeConnector, NodeId};
use shardstor::engine::StorageEngine;
use shardstor::metadata::{MetadataReplica, MetadataStore};
use shardstor::registry::{HeartbeatSender, HeartbeatSink, NodeRegistry};
use shardstor::rpc::NodeServer;
use shardstor::shard::ShardStore;

// =============================================================================
// CLI Arguments
// =============================================================================

/// ShardStor - distributed erasure-coded object storage
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,

    /// YAML configuration file
    #[arg(long, global = true, env = "SHARDSTOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a storage node
    Serve(ServeArgs),
    /// Print the effective configuration as YAML
    Config,
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Identity of this node; never reuse the id of a dead node
    #[arg(long, env = "NODE_ID")]
    node_id: String,

    /// RPC listen address
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:9100")]
    listen: String,

    /// Address other nodes use to reach this one (defaults to --listen)
    #[arg(long, env = "ADVERTISE_ADDR")]
    advertise: Option<String>,

    /// Directory for shards and metadata
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Host the Node Registry, Healing Manager and gateway on this node
    #[arg(long, env = "REGISTRY_HOST")]
    registry_host: bool,

    /// Address of the registry host (required unless --registry-host)
    #[arg(long, env = "REGISTRY_ADDR")]
    registry: Option<String>,

    /// Metadata replicas on other nodes, as id=address (registry host only)
    #[arg(long, env = "METADATA_PEERS", value_delimiter = ',')]
    peers: Vec<String>,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json)?;

    let config = match &cli.config {
        Some(path) => EngineConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config.validate().context("invalid configuration")?;

    match cli.command {
        Command::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Command::Serve(args) => serve(args, config).await,
    }
}

async fn serve(args: ServeArgs, config: EngineConfig) -> anyhow::Result<()> {
    let node_id = NodeId::new(args.node_id.clone());
    let advertise = args.advertise.clone().unwrap_or_else(|| args.listen.clone());

    info!("Starting ShardStor node");
    info!("  Node id: {}", node_id);
    info!("  Listen: {} (advertised as {})", args.listen, advertise);
    info!("  Data dir: {}", args.data_dir.display());
    info!("  Registry host: {}", args.registry_host);

    let shards = Arc::new(ShardStore::open(node_id.clone(), &args.data_dir, &config.shard_store)?);
    let replica = Arc::new(MetadataReplica::open(
        node_id.clone(),
        &args.data_dir,
        config.shard_store.sync_writes,
    )?);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl-C, shutting down"),
                Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
            }
            shutdown.cancel();
        });
    }

    let mut server = NodeServer::new(node_id.clone(), Arc::clone(&shards), Arc::clone(&replica));
    let mut background = Vec::new();

    let sink: Arc<dyn HeartbeatSink> = if args.registry_host {
        let registry = NodeRegistry::new(config.registry.clone());

        let peer_client = shardstor::adapters::http::build_client(config.metadata.rpc_timeout)?;
        let mut replicas: Vec<Arc<dyn MetadataService>> =
            vec![Arc::clone(&replica) as Arc<dyn MetadataService>];
        for peer in &args.peers {
            let (peer_id, address) = parse_peer(peer)?;
            info!("  Metadata peer: {} at {}", peer_id, address);
            replicas.push(Arc::new(HttpMetadataClient::new(peer_id, &address, peer_client.clone())));
        }
        let metadata = Arc::new(MetadataStore::new(node_id.clone(), replicas, config.metadata.clone()));

        let connector: Arc<dyn NodeConnector> = Arc::new(HttpConnector::new(config.write.rpc_timeout)?);
        let events: Arc<dyn EventPublisher> = Arc::new(
            CompositeEventPublisher::new().with_publisher(Arc::new(LoggingEventPublisher::new())),
        );

        let engine = Arc::new(StorageEngine::new(
            config.clone(),
            Arc::clone(&registry),
            connector,
            metadata,
            events,
        )?);
        background.extend(engine.spawn_background(shutdown.clone()));
        info!("Registry, healing manager and gateway started");

        server = server
            .with_registry(Arc::clone(&registry))
            .with_engine(engine);
        registry as Arc<dyn HeartbeatSink>
    } else {
        let Some(address) = &args.registry else {
            bail!("--registry is required unless --registry-host is set");
        };
        let client = shardstor::adapters::http::build_client(config.registry.heartbeat_interval)?;
        Arc::new(HttpRegistryClient::new(address, client)) as Arc<dyn HeartbeatSink>
    };

    let heartbeat = HeartbeatSender::new(
        node_id.clone(),
        advertise,
        Arc::clone(&shards),
        sink,
        config.registry.heartbeat_interval,
    );
    background.push(tokio::spawn(heartbeat.run(shutdown.clone())));

    let listener = NodeServer::bind(&args.listen).await?;
    let served = Arc::new(server).serve(listener, shutdown.clone()).await;

    // stop the background loops even when the server failed
    shutdown.cancel();
    for joined in join_all(background).await {
        if let Err(e) = joined {
            error!("Background task failed: {}", e);
        }
    }
    served?;

    info!("Node shutdown complete");
    Ok(())
}

/// `node-b=10.0.0.2:9100` into its id and address.
fn parse_peer(peer: &str) -> anyhow::Result<(NodeId, String)> {
    match peer.split_once('=') {
        Some((id, address)) if !id.is_empty() && !address.is_empty() => {
            Ok((NodeId::new(id.trim()), address.trim().to_string()))
        }
        _ => bail!("invalid peer '{}', expected id=address", peer),
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(log_level: &str, json: bool) -> anyhow::Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}
