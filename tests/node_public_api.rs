//! Integration tests for the Node public API.
//!
//! These tests run real nodes over loopback UDP and exercise the facade:
//! binding, bootstrap introduction, circuit growth from heartbeats,
//! telemetry and shutdown.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test node_public_api -- --nocapture

use std::net::SocketAddr;
use std::sync::Once;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use veilnet::{Node, NodeConfig, TunnelConfig};

/// One-time tracing initialization
static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("warn")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Allow time for async operations
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Loopback node without SOCKS5, walking quickly.
fn test_config() -> NodeConfig {
    NodeConfig {
        overlay_addr: loopback(),
        socks_addr: None,
        walk_interval: Duration::from_millis(100),
        tunnel: TunnelConfig {
            exit_bind_addr: loopback(),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let result = timeout(TEST_TIMEOUT, async {
        while !check().await {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

#[tokio::test]
async fn node_bind_and_local_addr() {
    init_tracing();
    let node = Node::bind(test_config()).await.expect("bind failed");

    let local_addr = node.local_addr();
    assert!(local_addr.ip().is_loopback());
    assert!(local_addr.port() > 0, "port should be assigned");
    assert_eq!(node.socks_addr(), None);
    assert_eq!(node.tunnel().local_addr(), local_addr);

    node.shutdown().await;
}

#[tokio::test]
async fn node_with_socks_ingress() {
    init_tracing();
    let config = NodeConfig {
        socks_addr: Some(loopback()),
        ..test_config()
    };
    let node = Node::bind(config).await.expect("bind failed");

    let socks = node.socks_addr().expect("SOCKS5 should be enabled");
    assert!(socks.port() > 0);
    // The ingress owns local deliveries.
    assert!(node.deliveries().await.is_err());

    let snapshot = node.telemetry().await;
    assert_eq!(snapshot.associations, 0);

    node.shutdown().await;
}

#[tokio::test]
async fn node_deliveries_can_be_taken_once() {
    init_tracing();
    let node = Node::bind(test_config()).await.expect("bind failed");

    assert!(node.deliveries().await.is_ok());
    assert!(node.deliveries().await.is_err(), "second take must fail");

    node.shutdown().await;
}

#[tokio::test]
async fn node_bind_conflict_fails() {
    init_tracing();
    let first = Node::bind(test_config()).await.expect("bind failed");

    let config = NodeConfig {
        overlay_addr: first.local_addr(),
        ..test_config()
    };
    assert!(Node::bind(config).await.is_err());

    first.shutdown().await;
}

#[tokio::test]
async fn bootstrap_introduction_builds_a_circuit() {
    init_tracing();
    let directory = Node::bind(test_config()).await.expect("bind failed");
    let config = NodeConfig {
        bootstrap: vec![directory.local_addr()],
        ..test_config()
    };
    let joiner = Node::bind(config).await.expect("bind failed");

    // The directory sees the joiner as a live peer and heartbeats open a
    // circuit through it.
    let tunnel = directory.tunnel().clone();
    let joiner_addr = joiner.local_addr();
    wait_for("directory to learn the joiner", || {
        let tunnel = tunnel.clone();
        async move { tunnel.candidates().await.iter().any(|c| c.addr == joiner_addr) }
    })
    .await;
    timeout(TEST_TIMEOUT, directory.tunnel().wait_ready())
        .await
        .expect("no circuit became ready")
        .unwrap();

    let circuits = directory.tunnel().circuits().await;
    assert!(circuits.iter().any(|c| c.first_hop == joiner_addr));

    // Bootstrap peers are walked but never become hop candidates.
    assert_eq!(joiner.tunnel().bootstrap_peers().await, vec![directory.local_addr()]);
    assert!(
        joiner
            .tunnel()
            .candidates()
            .await
            .iter()
            .all(|c| c.addr != directory.local_addr())
    );

    let snapshot = joiner.telemetry().await;
    assert_eq!(snapshot.local_addr, joiner_addr);
    assert!(snapshot.tunnel.tail_circuits >= 1);

    joiner.shutdown().await;
    directory.shutdown().await;
}

#[tokio::test]
async fn node_explicit_bootstrap() {
    init_tracing();
    let a = Node::bind(test_config()).await.expect("bind failed");
    let b = Node::bind(test_config()).await.expect("bind failed");

    b.bootstrap(a.local_addr()).await.expect("bootstrap failed");

    let tunnel = a.tunnel().clone();
    let b_addr = b.local_addr();
    wait_for("introduction to arrive", || {
        let tunnel = tunnel.clone();
        async move { tunnel.candidates().await.iter().any(|c| c.addr == b_addr) }
    })
    .await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn node_shutdown_stops_the_core() {
    init_tracing();
    let node = Node::bind(test_config()).await.expect("bind failed");
    let tunnel = node.tunnel().clone();

    node.shutdown().await;

    wait_for("core to stop", || {
        let tunnel = tunnel.clone();
        async move { tunnel.is_closed() }
    })
    .await;
    assert!(tunnel.create_circuit("127.0.0.1:9".parse().unwrap()).await.is_err());
    assert_eq!(tunnel.stats().await, Default::default());
}
