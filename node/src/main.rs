use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use kmesh_protocol::{
    ContainerCodec, Identifier, JsonContainerCodec, JsonFilePeerStore, KnowledgeNode,
    MemoryPeerStore, NodeConfig, PeerAddress, PeerStore,
};

#[derive(Parser)]
#[command(name = "kmesh-node", about = "Knowledge mesh node", version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct CommonArgs {
    /// TOML config file
    #[arg(long, global = true, env = "KMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory for the peer list and container cache
    #[arg(long, global = true, env = "KMESH_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve objects to peers until interrupted
    Serve {
        /// Interface to bind
        #[arg(long, env = "KMESH_HOST")]
        host: Option<String>,

        /// Port to listen on (0 picks a free port)
        #[arg(long, env = "KMESH_PORT")]
        port: Option<u16>,

        /// Host name peers should use to reach this node
        #[arg(long, env = "KMESH_PUBLIC_HOST")]
        public_host: Option<String>,

        /// Peer to register, as host:port
        #[arg(long = "peer")]
        peers: Vec<String>,

        /// Running node to join once serving, as host:port. The node
        /// registers us back.
        #[arg(long = "join")]
        join: Vec<String>,

        /// Container file to publish
        #[arg(long = "publish")]
        publish: Vec<PathBuf>,
    },
    /// Resolve one identifier through the mesh without serving
    Fetch {
        /// Peer to ask, as host:port
        #[arg(long = "peer", required = true)]
        peers: Vec<String>,

        /// Identifier, as <hash>:<kind>
        #[arg(long)]
        id: String,

        /// Write the object to this container file
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Manage the persisted peer list
    Peers {
        #[command(subcommand)]
        action: PeersAction,
    },
}

#[derive(Subcommand)]
enum PeersAction {
    List,
    Add { address: String },
    Remove { address: String },
}

fn load_config(common: &CommonArgs) -> Result<NodeConfig> {
    let mut config = match &common.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if let Some(dir) = &common.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli.common)?;

    match cli.command {
        Command::Serve {
            host,
            port,
            public_host,
            peers,
            join,
            publish,
        } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if public_host.is_some() {
                config.public_host = public_host;
            }
            config.seed_peers.extend(peers);
            serve(config, join, publish).await
        }
        Command::Fetch { peers, id, out } => {
            config.seed_peers = peers;
            fetch(config, &id, out).await
        }
        Command::Peers { action } => manage_peers(&config, action).await,
    }
}

async fn serve(config: NodeConfig, join: Vec<String>, publish: Vec<PathBuf>) -> Result<()> {
    let host = config.host.clone();
    let port = config.port;
    tracing::info!(host = %host, port = port, data_dir = %config.data_dir.display(), "Starting kmesh node");

    let node = KnowledgeNode::open(config)
        .await
        .context("Failed to initialise node")?;

    for path in &publish {
        let ids = node
            .publish_file(path)
            .await
            .with_context(|| format!("Failed to publish {}", path.display()))?;
        for id in ids {
            tracing::info!(id = %id, file = %path.display(), "Published");
        }
    }

    let addr = node
        .start(&host, port)
        .await
        .with_context(|| format!("Failed to bind {host}:{port}"))?;
    tracing::info!("Listening on {addr}");

    for raw in &join {
        let peer: PeerAddress = raw.parse()?;
        if let Err(e) = node.register_peer(&peer.host, peer.port, true).await {
            tracing::warn!(peer = %peer, error = %e, "Failed to join peer");
        }
    }

    shutdown_signal().await;
    node.stop().await;
    tracing::info!("Node shut down");
    Ok(())
}

async fn fetch(config: NodeConfig, raw_id: &str, out: Option<PathBuf>) -> Result<()> {
    let id: Identifier = raw_id.parse().context("Invalid identifier")?;
    let node = KnowledgeNode::new(
        config,
        Arc::new(JsonContainerCodec),
        Arc::new(MemoryPeerStore::new()),
    )
    .await
    .context("Failed to initialise node")?;

    let object = node.get(&id).await.with_context(|| format!("Lookup of {id} failed"))?;
    println!("{}", serde_json::to_string_pretty(object.as_ref())?);

    if let Some(out) = out {
        let bytes = JsonContainerCodec.encode(&object)?;
        std::fs::write(&out, bytes).with_context(|| format!("Failed to write {}", out.display()))?;
        tracing::info!(file = %out.display(), "Saved object");
    }
    Ok(())
}

async fn manage_peers(config: &NodeConfig, action: PeersAction) -> Result<()> {
    let store = JsonFilePeerStore::new(config.peers_file());
    match action {
        PeersAction::List => {
            for peer in store.list_peers().await? {
                println!("{peer}");
            }
        }
        PeersAction::Add { address } => {
            let peer: PeerAddress = address.parse()?;
            store.add_peer(&peer.host.to_lowercase(), peer.port).await?;
            tracing::info!(peer = %peer, "Peer added");
        }
        PeersAction::Remove { address } => {
            let peer: PeerAddress = address.parse()?;
            store.remove_peer(&peer.host.to_lowercase(), peer.port).await?;
            tracing::info!(peer = %peer, "Peer removed");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
