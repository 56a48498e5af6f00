//! End-to-end multipath session tests over the in-memory network
//!
//! Two controllers share a topology and a `MemoryNetwork`. Paths can be
//! taken down on the network to simulate loss during establishment.

use std::sync::Arc;
use std::time::Duration;

use panmux::metrics::MetricsRegistry;
use panmux::path::{Path, PathId, PathInterface, StaticTopology};
use panmux::selection::{DisjointSelector, LatencySelector, Selector};
use panmux::session::{ConnectOptions, SchedulingStrategy, SessionController, SessionEvent};
use panmux::transport::MemoryNetwork;
use panmux::{Config, DomainId, Error, PeerAddr};
use tokio::sync::broadcast;
use tokio::time::timeout;

// ============================================================================
// Helpers
// ============================================================================

fn path(id: u64) -> Path {
    Path::new(
        vec![
            PathInterface::new(DomainId::new(1, 1), 1),
            PathInterface::new(DomainId::new(1, 10), id),
            PathInterface::new(DomainId::new(1, 2), 1),
        ],
        1500,
    )
    .with_latencies(vec![Some(Duration::from_millis(id))])
}

fn ids(range: &[u64]) -> Vec<PathId> {
    range.iter().map(|&i| path(i).id()).collect()
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.session.collect_metrics = false;
    config.session.periodic_reselection = false;
    config.handshake.dial_read_timeout = Duration::from_millis(100);
    config.handshake.dial_retries = 2;
    config.handshake.accept_timeout = Duration::from_millis(800);
    config
}

struct Harness {
    network: MemoryNetwork,
    topology: Arc<StaticTopology>,
    client: Arc<SessionController>,
    server: Arc<SessionController>,
    client_registry: MetricsRegistry,
    server_registry: MetricsRegistry,
}

async fn harness(config: Config) -> Harness {
    let network = MemoryNetwork::new();
    let topology = Arc::new(StaticTopology::new());
    let client_addr: PeerAddr = "1-ff00:0:111,[127.0.0.1]:5000".parse().unwrap();
    let server_addr: PeerAddr = "1-ff00:0:110,[127.0.0.2]:4000".parse().unwrap();
    topology.set_paths(&server_addr, vec![path(1), path(2), path(3)]);
    topology.set_paths(&client_addr, vec![path(1), path(2), path(3)]);

    let controller = |addr, registry: &MetricsRegistry| {
        SessionController::new(
            &config,
            addr,
            topology.clone(),
            Arc::new(network.transport(registry.clone())),
        )
        .unwrap()
    };
    let client_registry = MetricsRegistry::new();
    let server_registry = MetricsRegistry::new();
    let client = controller(client_addr, &client_registry);
    let server = controller(server_addr, &server_registry);
    client.listen().await.unwrap();
    server.listen().await.unwrap();

    Harness {
        network,
        topology,
        client,
        server,
        client_registry,
        server_registry,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(3), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn path_changes(events: &[SessionEvent]) -> Vec<Vec<PathId>> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::PathSetChanged(ids) => Some(ids.clone()),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Establishment
// ============================================================================

#[tokio::test]
async fn test_ping_pong_with_dial_back() {
    let h = harness(test_config()).await;
    let server = Arc::clone(&h.server);
    let accept = tokio::spawn(async move {
        let selector: Arc<dyn Selector> = Arc::new(LatencySelector);
        server.wait_for_peer(Some(selector)).await
    });

    h.client
        .connect(h.server.local(), None, ConnectOptions::default())
        .await
        .unwrap();
    let peer = accept.await.unwrap().unwrap();
    assert_eq!(peer, h.client.local());
    assert_eq!(h.server.selected_paths(), ids(&[1, 2]));

    h.client.write(b"ping").await.unwrap();
    let mut buf = [0u8; 64];
    let n = h.server.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ping");

    // The client adopts the dial-back connections in the background.
    wait_until(|| h.client.connection_counts().0 == 2).await;
    h.server.write(b"pong").await.unwrap();
    let n = timeout(Duration::from_secs(2), h.client.read(&mut buf))
        .await
        .expect("client read timed out")
        .unwrap();
    assert_eq!(&buf[..n], b"pong");

    assert!(h.client.disconnect().await.is_empty());
    assert!(h.server.disconnect().await.is_empty());
}

#[tokio::test]
async fn test_partial_establishment_with_down_path() {
    let mut config = test_config();
    config.session.path_count = 3;
    let h = harness(config).await;
    h.network.set_path_down(path(2).id(), true);

    let server = Arc::clone(&h.server);
    let accept = tokio::spawn(async move { server.wait_for_peer(None).await });

    h.client
        .connect(h.server.local(), None, ConnectOptions::default())
        .await
        .unwrap();
    assert_eq!(h.client.selected_paths(), ids(&[1, 3]));
    assert_eq!(h.client.connection_counts(), (0, 2));

    accept.await.unwrap().unwrap();
    assert_eq!(h.server.connection_counts(), (2, 0));
}

#[tokio::test]
async fn test_all_paths_down_fails_connect() {
    let h = harness(test_config()).await;
    for i in 1..=3 {
        h.network.set_path_down(path(i).id(), true);
    }
    let server = Arc::clone(&h.server);
    tokio::spawn(async move {
        let _ = server.wait_for_peer(None).await;
    });

    let err = h
        .client
        .connect(h.server.local(), None, ConnectOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HandshakeTimeout { .. }));
    assert_eq!(h.client.connection_counts(), (0, 0));
}

#[tokio::test]
async fn test_connect_to_silent_peer_times_out() {
    let mut config = test_config();
    config.handshake.response_timeout = Duration::from_millis(200);
    let h = harness(config).await;
    // Nobody serves handshakes on the server's listener.
    let err = h
        .client
        .connect(h.server.local(), None, ConnectOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HandshakeTimeout { .. }));
}

// ============================================================================
// Reselection
// ============================================================================

#[tokio::test]
async fn test_unchanged_topology_is_noop() {
    let h = harness(test_config()).await;
    let server = Arc::clone(&h.server);
    tokio::spawn(async move {
        let _ = server.wait_for_peer(None).await;
    });

    h.client
        .connect(h.server.local(), None, ConnectOptions::default())
        .await
        .unwrap();
    let mut events = h.client.subscribe();

    let selected = h.client.reselect().await.unwrap();
    assert_eq!(selected, ids(&[1, 2]));
    assert!(drain(&mut events).is_empty());
    assert_eq!(h.client.history_len(), 1);
}

#[tokio::test]
async fn test_failed_lookup_keeps_connections() {
    let h = harness(test_config()).await;
    let server = Arc::clone(&h.server);
    tokio::spawn(async move {
        let _ = server.wait_for_peer(None).await;
    });

    h.client
        .connect(h.server.local(), None, ConnectOptions::default())
        .await
        .unwrap();

    h.topology.set_failing(true);
    let selected = h.client.reselect().await.unwrap();
    assert_eq!(selected, ids(&[1, 2]));
    assert_eq!(h.client.path_set().unwrap().len(), 3);

    h.client.write(b"still here").await.unwrap();
}

#[tokio::test]
async fn test_disjoint_exploration_falls_back_to_best() {
    let h = harness(test_config()).await;
    let server = Arc::clone(&h.server);
    tokio::spawn(async move {
        let _ = server.wait_for_peer(None).await;
    });

    let selector: Arc<dyn Selector> = Arc::new(DisjointSelector::new(1).unwrap());
    h.client
        .connect(h.server.local(), Some(selector), ConnectOptions::default())
        .await
        .unwrap();
    assert_eq!(h.client.selector_name(), "disjoint");
    assert_eq!(h.client.selected_paths(), ids(&[1, 2]));
    let mut events = h.client.subscribe();

    // Second combination: the fixed path plus the untried one.
    let selected = h.client.reselect().await.unwrap();
    assert_eq!(selected, ids(&[1, 3]));

    // Every combination tried; no traffic, so the earliest wins.
    let selected = h.client.reselect().await.unwrap();
    assert_eq!(selected, ids(&[1, 2]));
    assert_eq!(h.client.history_len(), 2);

    assert_eq!(
        path_changes(&drain(&mut events)),
        vec![ids(&[1, 3]), ids(&[1, 2])]
    );
}

#[tokio::test]
async fn test_background_reselection_follows_topology() {
    let mut config = test_config();
    config.session.periodic_reselection = true;
    config.session.reselect_interval = Duration::from_millis(100);
    let h = harness(config).await;
    let server = Arc::clone(&h.server);
    tokio::spawn(async move {
        let _ = server.wait_for_peer(None).await;
    });

    h.client
        .connect(h.server.local(), None, ConnectOptions::default())
        .await
        .unwrap();
    let mut events = h.client.subscribe();

    let slow = path(1).with_latencies(vec![Some(Duration::from_millis(50))]);
    h.topology
        .set_paths(&h.server.local(), vec![slow, path(2), path(3)]);

    let changed = timeout(Duration::from_secs(3), async {
        loop {
            if let Ok(SessionEvent::PathSetChanged(ids)) = events.recv().await {
                return ids;
            }
        }
    })
    .await
    .expect("no reselection happened");
    assert_eq!(changed, ids(&[2, 3]));
}

#[tokio::test]
async fn test_connect_options_disable_background_rounds() {
    let mut config = test_config();
    config.session.periodic_reselection = true;
    config.session.reselect_interval = Duration::from_millis(50);
    let h = harness(config).await;
    let server = Arc::clone(&h.server);
    tokio::spawn(async move {
        let _ = server.wait_for_peer(None).await;
    });

    let options = ConnectOptions {
        no_metrics_collection: true,
        no_periodic_reselection: true,
    };
    h.client
        .connect(h.server.local(), None, options)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.client.history_len(), 0);
}

#[tokio::test]
async fn test_acceptor_reads_after_first_path_changes() {
    let mut config = test_config();
    config.session.collect_metrics = true;
    config.session.metrics_interval = Duration::from_millis(50);
    let h = harness(config).await;
    let server = Arc::clone(&h.server);
    tokio::spawn(async move {
        let _ = server.wait_for_peer(None).await;
    });

    h.client
        .connect(h.server.local(), None, ConnectOptions::default())
        .await
        .unwrap();
    assert_eq!(h.client.selected_paths(), ids(&[1, 2]));

    // Path 1 becomes the slowest; the client now writes over path 2, which
    // is the second connection the server accepted.
    let slow = path(1).with_latencies(vec![Some(Duration::from_millis(50))]);
    h.topology
        .set_paths(&h.server.local(), vec![slow, path(2), path(3)]);
    assert_eq!(h.client.reselect().await.unwrap(), ids(&[2, 3]));
    wait_until(|| h.server.connection_counts() == (3, 0)).await;

    h.client.write(b"after reselect").await.unwrap();
    let mut buf = [0u8; 32];
    let n = timeout(Duration::from_secs(1), h.server.read(&mut buf))
        .await
        .expect("acceptor read stuck on a superseded connection")
        .unwrap();
    assert_eq!(&buf[..n], b"after reselect");

    // The next round closes the path 1 connection left stale above.
    let client_registered = h.client_registry.len();
    assert_eq!(h.client.reselect().await.unwrap(), ids(&[2, 3]));
    assert_eq!(h.client_registry.len(), client_registered - 1);

    wait_until(|| h.server.connection_counts() == (2, 0)).await;
    wait_until(|| h.server_registry.len() == 2).await;

    h.client.write(b"after close").await.unwrap();
    let n = timeout(Duration::from_secs(1), h.server.read(&mut buf))
        .await
        .expect("acceptor read stuck after stale close")
        .unwrap();
    assert_eq!(&buf[..n], b"after close");
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test]
async fn test_round_robin_spreads_writes() {
    let mut config = test_config();
    config.session.scheduler = SchedulingStrategy::RoundRobin;
    config.session.path_count = 3;
    let h = harness(config).await;
    let server = Arc::clone(&h.server);
    let accept = tokio::spawn(async move { server.wait_for_peer(None).await });

    h.client
        .connect(h.server.local(), None, ConnectOptions::default())
        .await
        .unwrap();
    accept.await.unwrap().unwrap();

    for i in 0u8..6 {
        h.client.write(&[i]).await.unwrap();
    }
    let mut buf = [0u8; 4];
    for i in 0u8..6 {
        let n = h.server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[i]);
    }
}

#[tokio::test]
async fn test_io_before_connect_fails() {
    let h = harness(test_config()).await;
    let mut buf = [0u8; 4];
    assert!(matches!(
        h.client.write(b"x").await,
        Err(Error::NoConnectionAvailable("write"))
    ));
    assert!(matches!(
        h.client.read(&mut buf).await,
        Err(Error::NoConnectionAvailable("read"))
    ));
}

// ============================================================================
// Metrics
// ============================================================================

#[tokio::test]
async fn test_metrics_tick_feeds_path_quality() {
    let h = harness(test_config()).await;
    let server = Arc::clone(&h.server);
    tokio::spawn(async move {
        let _ = server.wait_for_peer(None).await;
    });

    h.client
        .connect(h.server.local(), None, ConnectOptions::default())
        .await
        .unwrap();
    h.client.write(&[7u8; 4096]).await.unwrap();
    h.client.record_metrics();

    let set = h.client.path_set().unwrap();
    let first = set.get(&path(1).id()).unwrap();
    assert_eq!(first.metrics.sample_count(), 1);
    assert!(first.max_bandwidth() >= 4096);
    assert_eq!(set.get(&path(3).id()).unwrap().metrics.sample_count(), 0);
}
