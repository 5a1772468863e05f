//! relaymesh node
//!
//! Runs one mesh participant: a routing server that assigns identifiers and
//! forwards frames, or an agent/client that keeps a connection to a server.

use clap::Parser;
use relaymesh::net::{InstanceKind, MeshConfig, MeshNode, NetEvent, ReconnectConfig, Target};
use std::net::{IpAddr, SocketAddr};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

/// relaymesh version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "relaymesh", version, about = "relaymesh: routed instance mesh node")]
struct Args {
    /// Instance kind: server, agent, client
    #[arg(short, long, default_value = "server")]
    kind: String,

    /// Listen port (server only)
    #[arg(short, long, default_value = "8768")]
    port: u16,

    /// Listen address (server only)
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Own node identifier (servers default to 0, others are assigned one)
    #[arg(short, long)]
    node_id: Option<u32>,

    /// Servers to connect to, host[:port] (comma-separated)
    #[arg(short, long)]
    servers: Option<String>,

    /// Give up reconnecting after this many passes over the server list
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Maximum concurrent inbound connections
    #[arg(long, default_value = "1024")]
    max_connections: usize,

    /// Leave the authentication gate closed until a login handler opens it
    #[arg(long)]
    manual_auth: bool,
}

fn node_config(args: &Args, kind: InstanceKind) -> MeshConfig {
    MeshConfig {
        kind,
        node_id: args.node_id,
        listen_addr: SocketAddr::new(args.bind, args.port),
        max_connections: args.max_connections,
        auto_authenticate: !args.manual_auth,
        ..Default::default()
    }
}

fn parse_targets(servers: &str) -> Result<Vec<Target>, String> {
    servers
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Target>().map_err(|e| e.to_string()))
        .collect()
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relaymesh=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let kind = match args.kind.parse::<InstanceKind>() {
        Ok(kind) => kind,
        Err(_) => {
            error!("Invalid instance kind. Use: server, agent, client");
            return;
        }
    };

    let targets = match args.servers.as_deref().map(parse_targets).transpose() {
        Ok(targets) => targets.unwrap_or_default(),
        Err(e) => {
            error!("Invalid server list: {}", e);
            return;
        }
    };
    if !kind.is_server() && targets.is_empty() {
        error!("An {} needs at least one server (--servers)", kind);
        return;
    }

    info!("════════════════════════════════════════════════════════════");
    info!("  relaymesh v{}", VERSION);
    info!("════════════════════════════════════════════════════════════");
    info!("Kind: {} | Port: {}", kind, args.port);
    if !targets.is_empty() {
        let list: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
        info!("Servers: {}", list.join(", "));
    }

    let node = match MeshNode::builder(node_config(&args, kind)).build() {
        Ok(node) => node,
        Err(e) => {
            error!("Failed to create node: {}", e);
            return;
        }
    };

    // Event handler loop
    let mut events = node.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(NetEvent::NodeAdded { node, kind }) => info!("Node added: {} ({})", node, kind),
                Ok(NetEvent::LinkAdded { node, addr, inbound }) => {
                    let dir = if inbound { "inbound" } else { "outbound" };
                    info!("Link to node {}: {} ({})", node, addr, dir);
                }
                Ok(NetEvent::NodeRemoved { node }) => info!("Node removed: {}", node),
                Ok(NetEvent::EndpointClosed { node }) => info!("Endpoint closed: {}", node),
                Ok(NetEvent::HandshakeFailed { addr, reason }) => {
                    warn!("Handshake with {} failed: {}", addr, reason)
                }
                Err(RecvError::Lagged(n)) => warn!("Event observer lagged by {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if kind.is_server() {
        if let Err(e) = node.listen().await {
            error!("Failed to listen on {}: {}", node.config().listen_addr, e);
            return;
        }
    }

    if !targets.is_empty() {
        let reconnect = ReconnectConfig {
            max_iterations: args.max_iterations,
            ..ReconnectConfig::with_targets(targets)
        };
        if let Err(e) = node.maintain(reconnect) {
            error!("Invalid reconnect settings: {}", e);
            return;
        }
    }

    // Status printer
    let status = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let id = status
                .local_id()
                .map(|id| id.to_string())
                .unwrap_or_else(|| "unassigned".to_string());
            info!("Status: node {} | {} connections", id, status.connection_count());
        }
    });

    info!("relaymesh {} running ({})", kind, node.uuid());

    // Wait for shutdown
    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");
    node.shutdown();
}
