//! TCP transport tests over loopback.
//!
//! Covers frame exchange on raw connections and a full session between two
//! controllers using TCP for every connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use panmux::metrics::MetricsRegistry;
use panmux::path::{Path, PathInterface, StaticTopology};
use panmux::session::{ConnectOptions, SessionController};
use panmux::transport::{create_transport, TcpTransport, Transport, TransportConfig, TransportKind};
use panmux::{Config, DomainId, Direction, PeerAddr};
use tokio::time::timeout;

fn path(id: u64) -> Path {
    Path::new(
        vec![
            PathInterface::new(DomainId::new(1, 1), 1),
            PathInterface::new(DomainId::new(1, 10), id),
            PathInterface::new(DomainId::new(1, 2), 1),
        ],
        1400,
    )
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

// ============================================================================
// Connections
// ============================================================================

#[tokio::test]
async fn test_tcp_listen_ephemeral_port() {
    let transport = TcpTransport::new(TransportConfig::default(), MetricsRegistry::new());
    let listener = transport.listen(loopback()).await.unwrap();
    assert!(listener.local_addr().port() > 0);
    assert_eq!(transport.kind(), TransportKind::Tcp);
}

#[tokio::test]
async fn test_tcp_frames_keep_boundaries() {
    let registry = MetricsRegistry::new();
    let transport = TcpTransport::new(TransportConfig::default(), registry.clone());
    let listener = transport.listen(loopback()).await.unwrap();
    let addr = listener.local_addr();

    let client = transport.dial(None, addr, Some(path(1))).await.unwrap();
    let server = listener.accept().await.unwrap();

    assert_eq!(client.direction(), Direction::Outgoing);
    assert_eq!(server.direction(), Direction::Incoming);
    assert_eq!(client.path_id(), Some(path(1).id()));
    assert_eq!(server.path_id(), None);

    client.write(b"first").await.unwrap();
    client.write(b"second frame").await.unwrap();

    let mut buf = [0u8; 64];
    let n = server.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"first");
    let n = server.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"second frame");

    server.write(b"reply").await.unwrap();
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"reply");

    assert_eq!(client.metrics().snapshot().written_bytes, 17);
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn test_tcp_close_wakes_reader() {
    let transport = TcpTransport::new(TransportConfig::default(), MetricsRegistry::new());
    let listener = transport.listen(loopback()).await.unwrap();
    let client = transport.dial(None, listener.local_addr(), None).await.unwrap();
    let server = listener.accept().await.unwrap();

    let reader = Arc::clone(&server);
    let pending = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        reader.read(&mut buf).await
    });

    client.close().await.unwrap();
    let result = timeout(Duration::from_secs(2), pending)
        .await
        .expect("reader not woken")
        .unwrap();
    assert!(result.unwrap_err().is_closed());
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_tcp_dial_refused() {
    let transport = TcpTransport::new(TransportConfig::default(), MetricsRegistry::new());
    let addr = {
        let listener = transport.listen(loopback()).await.unwrap();
        listener.local_addr()
    };
    assert!(transport.dial(None, addr, None).await.is_err());
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn test_tcp_session_round_trip() {
    let mut config = Config::default();
    config.session.collect_metrics = false;
    config.session.periodic_reselection = false;
    config.handshake.accept_timeout = Duration::from_secs(2);

    let client_addr: PeerAddr = "1-ff00:0:111,[127.0.0.1]:38500".parse().unwrap();
    let server_addr: PeerAddr = "1-ff00:0:110,[127.0.0.1]:38400".parse().unwrap();
    let topology = Arc::new(StaticTopology::new());
    topology.set_paths(&server_addr, vec![path(1), path(2)]);

    let new_controller = |addr| {
        let transport: Arc<dyn Transport> =
            create_transport(&config.transport, MetricsRegistry::new(), None);
        SessionController::new(&config, addr, topology.clone(), transport).unwrap()
    };
    let client = new_controller(client_addr);
    let server = new_controller(server_addr);
    server.listen().await.unwrap();

    let accepting = Arc::clone(&server);
    let accept = tokio::spawn(async move { accepting.wait_for_peer(None).await });

    client
        .connect(server_addr, None, ConnectOptions::default())
        .await
        .unwrap();
    let peer = accept.await.unwrap().unwrap();
    assert_eq!(peer, client_addr);
    assert_eq!(client.connection_counts(), (0, 2));
    assert_eq!(server.connection_counts(), (2, 0));

    for i in 0u8..10 {
        client.write(&[i; 32]).await.unwrap();
    }
    let mut buf = [0u8; 64];
    for i in 0u8..10 {
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[i; 32]);
    }

    assert!(client.disconnect().await.is_empty());
    assert!(server.disconnect().await.is_empty());
}
