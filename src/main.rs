use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ringnet::net::grpc::client::GrpcTransport;
use ringnet::net::grpc::server::RpcServer;
use ringnet::net::transport::Transport;
use ringnet::ring::id::{Address, KeySpace};
use ringnet::ring::node::Node;
use ringnet::ring::workers::spawn_maintenance;
use ringnet::{RingConfig, RingError};

#[derive(Parser)]
#[command(name = "ringnet")]
#[command(version, about = "A Chord ring overlay node")]
struct Cli {
    /// JSON file with protocol parameters (ring width, intervals, timeouts)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new ring with this node as its first member
    Create {
        /// Address this node is reachable at
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(short, long)]
        port: u16,
    },
    /// Join an existing ring through a node already on it
    Join {
        /// Address this node is reachable at
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(short, long)]
        port: u16,
        /// host:port of the known node to join through
        #[arg(short = 'b', long = "bootstrap")]
        bootstrap: String,
    },
    /// Ask a ring node which member owns a key
    Lookup {
        /// host:port of any node on the ring
        #[arg(short = 'n', long = "node")]
        node: String,
        /// Key to resolve
        key: String,
        /// Also report how many hops the lookup took
        #[arg(long)]
        trace: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), RingError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => RingConfig::load(path)?,
        None => RingConfig::default(),
    };

    match cli.command {
        Commands::Create { host, port } => run_node(config, host, port, None).await,
        Commands::Join {
            host,
            port,
            bootstrap,
        } => run_node(config, host, port, Some(bootstrap)).await,
        Commands::Lookup { node, key, trace } => lookup(config, &node, &key, trace).await,
    }
}

async fn run_node(
    config: RingConfig,
    host: String,
    port: u16,
    bootstrap: Option<String>,
) -> Result<(), RingError> {
    let transport: Arc<dyn Transport> = Arc::new(GrpcTransport::from_config(&config)?);
    let node = Node::new(config, host, port, transport)?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    let server = RpcServer::new(Arc::clone(&node), shutdown_rx, Some(ready_tx));
    let mut server_handle = tokio::spawn(server.run());
    ready_rx
        .await
        .map_err(|_| RingError::Server("rpc server failed to start".into()))?;

    match bootstrap {
        None => node.create().await?,
        Some(peer) => {
            let peer = parse_endpoint(node.space(), &peer)?;
            node.join(&peer).await?;
        }
    }

    let _maintenance = spawn_maintenance(&node);
    info!(node = %node.address(), "node running, ctrl-c to leave");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| RingError::Server(format!("signal handler: {e}")))?;
            info!("received shutdown signal");
            if let Err(e) = node.leave().await {
                error!(error = %e, "leave failed");
            }
            let _ = shutdown_tx.send(());
            match (&mut server_handle).await {
                Ok(result) => result?,
                Err(e) => return Err(RingError::Server(format!("server task failed: {e}"))),
            }
            info!("node shut down");
            Ok(())
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(RingError::Server(format!("server task failed: {e}"))),
            }
        }
    }
}

async fn lookup(config: RingConfig, node: &str, key: &str, trace: bool) -> Result<(), RingError> {
    let space = KeySpace::new(config.bits)?;
    let transport = GrpcTransport::from_config(&config)?;
    let peer = parse_endpoint(&space, node)?;
    let id = space.hash(key.as_bytes());

    if trace {
        let (owner, hops) = transport.trace_successor(&peer, id, 0).await?;
        println!("{owner} ({hops} hops)");
    } else {
        let owner = transport.find_successor(&peer, id).await?;
        println!("{owner}");
    }
    Ok(())
}

fn parse_endpoint(space: &KeySpace, endpoint: &str) -> Result<Address, RingError> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| RingError::Config(format!("expected host:port, got {endpoint:?}")))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| RingError::Config(format!("bad port in {endpoint:?}: {e}")))?;
    Ok(Address::new(space, host, port))
}
