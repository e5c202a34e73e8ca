//! Concord node daemon (concordd).
//!
//! Runs a standalone coordination node: publishes its record to a
//! directory shared with the other nodes, links to every live peer and
//! serves lock and mapping traffic until interrupted.
//!
//! Usage:
//!   concordd [OPTIONS] --name <NAME> <REGISTRY_DIR>

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use concord::{FileNodeRepository, Node, NodeConfig};
use concord_proto::constants::CONCORD_LISTEN_PORT;
use concord_proto::defaults::{DEFAULT_MINISTER_COUNT, DEFAULT_PEER_REFRESH_INTERVAL_SECS};

/// Concord coordination node
#[derive(Parser, Debug)]
#[command(name = "concordd", version, about = "Concord coordination node")]
struct Args {
    /// Directory of node records shared by the cluster
    #[arg(value_name = "DIR")]
    registry: PathBuf,

    /// Unique node name
    #[arg(short = 'n', long)]
    name: String,

    /// Host name peers in the same region connect to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Host name peers in other regions connect to (defaults to --host)
    #[arg(long)]
    public_host: Option<String>,

    /// Region this node runs in
    #[arg(short = 'r', long)]
    region: Option<String>,

    /// Listen address
    #[arg(short = 'b', long, default_value = "0.0.0.0")]
    bind_addr: String,

    /// Listen port
    #[arg(short = 'p', long, default_value_t = CONCORD_LISTEN_PORT)]
    port: u16,

    /// Seconds between peer refreshes
    #[arg(long, default_value_t = DEFAULT_PEER_REFRESH_INTERVAL_SECS)]
    refresh_secs: u64,

    /// Number of nodes eligible to master remote mappings
    #[arg(long, default_value_t = DEFAULT_MINISTER_COUNT)]
    ministers: usize,

    /// Secret shared by every node of the cluster; peers without it are refused
    #[arg(long)]
    shared_secret: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("concordd v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config = NodeConfig::new(args.name, args.host.clone());
    config.public_host_name = args.public_host.unwrap_or(args.host);
    config.region = args.region;
    config.bind_addr = args.bind_addr;
    config.port = args.port;
    config.refresh_interval = Duration::from_secs(args.refresh_secs.max(1));
    config.minister_count = args.ministers.max(1);
    config.shared_secret = args.shared_secret;

    let repository = match FileNodeRepository::open(&args.registry).await {
        Ok(repo) => repo,
        Err(e) => {
            error!("failed to open registry {}: {}", args.registry.display(), e);
            std::process::exit(1);
        }
    };

    let handle = match Node::new(config).start(Arc::new(repository)).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("failed to start node: {}", e);
            std::process::exit(1);
        }
    };
    info!("node {} listening on port {}", handle.node_name(), handle.port());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to wait for ctrl-c: {}", e);
    }
    info!("received shutdown signal");
    handle.shutdown().await;
    info!("concordd stopped");
}
