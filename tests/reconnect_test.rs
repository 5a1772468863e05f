//! Reconnect loop tests against real sockets

use relaymesh::net::{InstanceKind, MeshConfig, MeshNode, ReconnectConfig, Target};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(10);

fn agent() -> MeshNode {
    let config = MeshConfig {
        kind: InstanceKind::Agent,
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    };
    MeshNode::builder(config).build().unwrap()
}

fn reconnect(target: Target, max_iterations: Option<u32>) -> ReconnectConfig {
    ReconnectConfig {
        timeout_ms: 100,
        max_timeout_ms: 400,
        flatness: 2.0,
        max_iterations,
        ..ReconnectConfig::with_targets(vec![target])
    }
}

/// Port with nothing listening on it.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_server(addr: SocketAddr) -> MeshNode {
    let config = MeshConfig {
        listen_addr: addr,
        ..MeshConfig::server()
    };
    let server = MeshNode::builder(config).build().unwrap();

    // The previous listener on this port may still be shutting down
    let deadline = Instant::now() + WAIT;
    loop {
        match server.listen().await {
            Ok(_) => return server,
            Err(_) if Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => panic!("could not bind {}: {}", addr, e),
        }
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_single_iteration_against_closed_port() {
    let node = agent();
    let target = Target::new("127.0.0.1", closed_port().await);

    let started = Instant::now();
    let result = node.connect_loop(reconnect(target, Some(1))).await.unwrap();

    assert!(result.is_none());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(node.local_id(), None);
}

#[tokio::test]
async fn test_invalid_reconnect_config_rejected() {
    let node = agent();
    assert!(node.connect_loop(ReconnectConfig::default()).await.is_err());
    assert!(node.maintain(ReconnectConfig::default()).is_err());
}

#[tokio::test]
async fn test_shutdown_cancels_reconnect() {
    let node = agent();
    let target = Target::new("127.0.0.1", closed_port().await);

    let handle = node.spawn_reconnect(reconnect(target, None)).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!handle.is_finished());

    node.shutdown();
    let result = tokio::time::timeout(WAIT, handle.join()).await.unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn test_connects_once_server_appears() {
    let node = agent();
    let addr: SocketAddr = format!("127.0.0.1:{}", closed_port().await).parse().unwrap();
    let target = Target::new("127.0.0.1", addr.port());

    let handle = node.spawn_reconnect(reconnect(target, None)).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let server = start_server(addr).await;
    let conn = tokio::time::timeout(WAIT, handle.join()).await.unwrap().unwrap();

    assert_eq!(conn.remote_node(), Some(0));
    assert!(node.local_id().is_some());
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn test_maintain_gets_fresh_identifier_after_server_restart() {
    let port = closed_port().await;
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let server = start_server(addr).await;

    let node = agent();
    let task = node.maintain(reconnect(Target::new("127.0.0.1", port), None)).unwrap();

    wait_until(|| node.connection_count() == 1).await;
    let first_id = node.local_id().unwrap();

    server.shutdown();
    wait_until(|| node.connection_count() == 0).await;

    let restarted = start_server(addr).await;
    wait_until(|| restarted.connection_count() == 1).await;

    // The restarted server allocates afresh; 1 in MAX_NODE_ID chance of a repeat
    let second_id = node.local_id().unwrap();
    assert_ne!(second_id, first_id);
    assert!(restarted.registry().contains(second_id));
    assert!(!restarted.registry().contains(first_id));

    node.shutdown();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
}
