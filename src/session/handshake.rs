//! Multi-port session establishment.
//!
//! The initiator opens a base connection to the acceptor's well-known
//! address and asks for `n` additional ports. The acceptor binds one
//! listener per slot, answers with the port list, and waits for one dialed
//! connection per port. Each of those connections is confirmed by a
//! `DialPacket` exchange before it is handed to the caller.
//!
//! A slot that fails only loses that one connection. The caller compares
//! the number of returned connections with the number requested.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Error, ProtocolError, Result};
use crate::path::Path;
use crate::protocol::{recv_message, send_message, DialPacket, HandshakeRequest, HandshakeResponse};
use crate::transport::{Connection, Listener, Transport};
use crate::types::{PeerAddr, PeerKey};

/// Handshake configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Dial packet attempts per connection.
    #[serde(default = "default_dial_retries")]
    pub dial_retries: u32,

    /// Wait for the dial packet echo, per attempt.
    #[serde(default = "default_dial_read_timeout", with = "humantime_serde")]
    pub dial_read_timeout: Duration,

    /// Bound on the acceptor waiting for all negotiated ports.
    #[serde(default = "default_accept_timeout", with = "humantime_serde")]
    pub accept_timeout: Duration,

    /// Wait for the handshake request or response on the base connection.
    #[serde(default = "default_response_timeout", with = "humantime_serde")]
    pub response_timeout: Duration,

    /// Port offset between slots.
    #[serde(default = "default_port_stride")]
    pub port_stride: u16,

    /// Port offset between peers.
    #[serde(default = "default_peer_stride")]
    pub peer_stride: u16,
}

fn default_dial_retries() -> u32 {
    5
}
fn default_dial_read_timeout() -> Duration {
    Duration::from_secs(3)
}
fn default_accept_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_response_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_port_stride() -> u16 {
    11
}
fn default_peer_stride() -> u16 {
    52
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            dial_retries: default_dial_retries(),
            dial_read_timeout: default_dial_read_timeout(),
            accept_timeout: default_accept_timeout(),
            response_timeout: default_response_timeout(),
            port_stride: default_port_stride(),
            peer_stride: default_peer_stride(),
        }
    }
}

/// Port the acceptor listens on for `slot` of its `peer_index`-th peer.
///
/// `base + port_stride * (slot + 1) + peer_stride * peer_index`, failing
/// when the result leaves the port range.
pub fn port_for_slot(config: &HandshakeConfig, base: u16, slot: usize, peer_index: usize) -> Result<u16> {
    let overflow = || {
        Error::HandshakeFailed(format!(
            "port for slot {slot} of peer {peer_index} exceeds the port range (base {base})"
        ))
    };
    let slot = u16::try_from(slot + 1).map_err(|_| overflow())?;
    let peer = u16::try_from(peer_index).map_err(|_| overflow())?;

    config
        .port_stride
        .checked_mul(slot)
        .and_then(|s| config.peer_stride.checked_mul(peer).and_then(|p| s.checked_add(p)))
        .and_then(|offset| base.checked_add(offset))
        .ok_or_else(overflow)
}

/// Handshake progress, per side.
///
/// Initiator: `Idle → HandshakeSent → PortsNegotiated → Established`.
/// Acceptor: `Idle → HandshakeReceived → DialingBack → Established`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    Idle,
    HandshakeSent,
    PortsNegotiated,
    HandshakeReceived,
    DialingBack,
    Established,
}

impl HandshakeState {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::HandshakeSent | Self::HandshakeReceived)
                | (Self::HandshakeSent, Self::PortsNegotiated)
                | (Self::PortsNegotiated, Self::Established)
                | (Self::HandshakeReceived, Self::DialingBack)
                | (Self::DialingBack, Self::Established)
        )
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::HandshakeSent => write!(f, "handshake_sent"),
            Self::PortsNegotiated => write!(f, "ports_negotiated"),
            Self::HandshakeReceived => write!(f, "handshake_received"),
            Self::DialingBack => write!(f, "dialing_back"),
            Self::Established => write!(f, "established"),
        }
    }
}

struct Progress {
    state: HandshakeState,
    remote: SocketAddr,
}

impl Progress {
    fn new(remote: SocketAddr) -> Self {
        Self {
            state: HandshakeState::Idle,
            remote,
        }
    }

    fn advance(&mut self, next: HandshakeState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::HandshakeFailed(format!(
                "invalid transition {} -> {next}",
                self.state
            )));
        }
        debug!(remote = %self.remote, from = %self.state, to = %next, "Handshake state");
        self.state = next;
        Ok(())
    }
}

/// Result of one handshake.
#[derive(Debug)]
pub struct HandshakeOutcome {
    /// The remote side's session address.
    pub peer: PeerAddr,
    /// Established connections, in slot order.
    pub connections: Vec<Arc<dyn Connection>>,
    /// Number of connections negotiated.
    pub requested: usize,
}

impl HandshakeOutcome {
    pub fn is_partial(&self) -> bool {
        self.connections.len() < self.requested
    }
}

/// Dialing side of the handshake.
pub struct Initiator {
    transport: Arc<dyn Transport>,
    config: HandshakeConfig,
    local: PeerAddr,
}

impl Initiator {
    pub fn new(transport: Arc<dyn Transport>, config: HandshakeConfig, local: PeerAddr) -> Self {
        Self {
            transport,
            config,
            local,
        }
    }

    /// Establish one connection per path to `remote`.
    ///
    /// Fails only when no connection at all could be established.
    pub async fn connect(&self, remote: PeerAddr, paths: &[Path]) -> Result<HandshakeOutcome> {
        if paths.is_empty() {
            return Err(Error::HandshakeFailed("no paths to connect over".into()));
        }
        let requested = u16::try_from(paths.len())
            .map_err(|_| Error::HandshakeFailed(format!("too many paths: {}", paths.len())))?;

        let mut progress = Progress::new(remote.host);
        let base = self.transport.dial(None, remote.host, None).await?;

        let negotiated = self.negotiate(&mut progress, base.as_ref(), requested).await;
        if let Err(e) = base.close().await {
            debug!(remote = %remote, error = %e, "Closing base connection failed");
        }
        let response = negotiated?;

        let mut set = JoinSet::new();
        for (slot, (path, port)) in paths.iter().zip(&response.ports).enumerate() {
            let transport = Arc::clone(&self.transport);
            let config = self.config.clone();
            let local = self.local;
            let path = path.clone();
            let addr = SocketAddr::new(remote.ip(), *port);
            set.spawn(async move {
                (slot, dial_path(transport.as_ref(), &config, local, addr, path).await)
            });
        }

        let mut connections = Vec::with_capacity(paths.len());
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((slot, Ok(conn))) => connections.push((slot, conn)),
                Ok((slot, Err(e))) => {
                    warn!(remote = %remote, slot, error = %e, "Connection handshake failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    warn!(remote = %remote, error = %e, "Dial task failed");
                    first_error.get_or_insert(Error::HandshakeFailed(e.to_string()));
                }
            }
        }

        if connections.is_empty() {
            return Err(first_error.unwrap_or(Error::HandshakeFailed("no connection established".into())));
        }

        connections.sort_by_key(|(slot, _)| *slot);
        progress.advance(HandshakeState::Established)?;
        info!(
            remote = %remote,
            established = connections.len(),
            requested = paths.len(),
            "Session connections established"
        );

        Ok(HandshakeOutcome {
            peer: remote,
            connections: connections.into_iter().map(|(_, c)| c).collect(),
            requested: paths.len(),
        })
    }

    async fn negotiate(
        &self,
        progress: &mut Progress,
        base: &dyn Connection,
        requested: u16,
    ) -> Result<HandshakeResponse> {
        send_message(
            base,
            HandshakeRequest {
                local_addr: self.local,
                num_ports: requested,
            },
        )
        .await?;
        progress.advance(HandshakeState::HandshakeSent)?;

        let response = timeout(self.config.response_timeout, recv_message(base))
            .await
            .map_err(|_| Error::HandshakeTimeout {
                remote: base.remote_addr(),
                attempts: 1,
            })??
            .into_response()?;

        if response.ports.len() != usize::from(requested) {
            return Err(ProtocolError::PortMismatch {
                requested: usize::from(requested),
                offered: response.ports.len(),
            }
            .into());
        }

        debug!(
            remote = %response.local_addr,
            ports = ?response.ports,
            "Ports negotiated"
        );
        progress.advance(HandshakeState::PortsNegotiated)?;
        Ok(response)
    }
}

impl fmt::Debug for Initiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Initiator")
            .field("local", &self.local)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Dial `remote` over `path` and confirm it with a dial packet exchange.
async fn dial_path(
    transport: &dyn Transport,
    config: &HandshakeConfig,
    local: PeerAddr,
    remote: SocketAddr,
    path: Path,
) -> Result<Arc<dyn Connection>> {
    let path_id = path.id();
    let conn = transport.dial(None, remote, Some(path.clone())).await?;
    let packet = DialPacket {
        local_addr: local.with_port(conn.local_addr().port()),
        path: Some(path),
    };

    for attempt in 1..=config.dial_retries {
        debug!(remote = %remote, path = %path_id, attempt, "Sending dial packet");
        send_message(conn.as_ref(), packet.clone()).await?;

        match timeout(config.dial_read_timeout, recv_message(conn.as_ref())).await {
            Ok(Ok(msg)) => {
                let echo = msg.into_dial_packet()?;
                debug!(remote = %echo.local_addr, path = %path_id, "Dial packet echoed");
                return Ok(conn);
            }
            Ok(Err(e)) if e.is_closed() => {
                return Err(e);
            }
            Ok(Err(e)) => {
                debug!(remote = %remote, attempt, error = %e, "Invalid dial packet echo");
            }
            Err(_) => {
                debug!(remote = %remote, attempt, "Dial packet echo timed out");
            }
        }
    }

    if let Err(e) = conn.close().await {
        debug!(remote = %remote, error = %e, "Closing failed connection");
    }
    Err(Error::HandshakeTimeout {
        remote,
        attempts: config.dial_retries,
    })
}

/// Listening side of the handshake.
///
/// Each distinct peer is assigned a port block on its first handshake and
/// keeps it for later handshakes.
pub struct Acceptor {
    transport: Arc<dyn Transport>,
    config: HandshakeConfig,
    local: PeerAddr,
    peer_slots: Mutex<HashMap<PeerKey, usize>>,
}

impl Acceptor {
    pub fn new(transport: Arc<dyn Transport>, config: HandshakeConfig, local: PeerAddr) -> Self {
        Self {
            transport,
            config,
            local,
            peer_slots: Mutex::new(HashMap::new()),
        }
    }

    fn peer_index(&self, peer: &PeerAddr) -> usize {
        let mut slots = self.peer_slots.lock();
        let next = slots.len() + 1;
        *slots.entry(peer.key()).or_insert(next)
    }

    /// Serve one handshake arriving on `base`.
    ///
    /// Waits at most `accept_timeout` for the negotiated connections and
    /// fails only when none of them completed.
    pub async fn accept(&self, base: Arc<dyn Connection>) -> Result<HandshakeOutcome> {
        let mut progress = Progress::new(base.remote_addr());
        let result = self.serve(&mut progress, base.as_ref()).await;
        if let Err(e) = base.close().await {
            debug!(error = %e, "Closing base connection failed");
        }
        result
    }

    async fn serve(&self, progress: &mut Progress, base: &dyn Connection) -> Result<HandshakeOutcome> {
        let request = timeout(self.config.response_timeout, recv_message(base))
            .await
            .map_err(|_| Error::HandshakeTimeout {
                remote: base.remote_addr(),
                attempts: 1,
            })??
            .into_request()?;
        progress.advance(HandshakeState::HandshakeReceived)?;

        let peer = request.local_addr;
        let requested = usize::from(request.num_ports);
        if requested == 0 {
            return Err(Error::HandshakeFailed(format!("{peer} requested no ports")));
        }
        debug!(peer = %peer, ports = requested, "Handshake request received");

        let peer_index = self.peer_index(&peer);
        let mut listeners: Vec<Box<dyn Listener>> = Vec::with_capacity(requested);
        let mut ports = Vec::with_capacity(requested);
        for slot in 0..requested {
            let port = port_for_slot(&self.config, self.local.port(), slot, peer_index)?;
            let addr = SocketAddr::new(self.local.ip(), port);
            listeners.push(self.transport.listen(addr).await?);
            ports.push(port);
        }

        send_message(
            base,
            HandshakeResponse {
                local_addr: self.local,
                num_ports: request.num_ports,
                ports: ports.clone(),
            },
        )
        .await?;
        progress.advance(HandshakeState::DialingBack)?;

        let mut set = JoinSet::new();
        for (slot, listener) in listeners.into_iter().enumerate() {
            let local = self.local.with_port(ports[slot]);
            set.spawn(async move { (slot, accept_dial(listener, local).await) });
        }

        let mut connections = Vec::with_capacity(requested);
        let barrier = timeout(self.config.accept_timeout, async {
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((slot, Ok(conn))) => {
                        debug!(peer = %peer, slot, of = requested, "Dialed in");
                        connections.push((slot, conn));
                    }
                    Ok((slot, Err(e))) => {
                        warn!(peer = %peer, slot, error = %e, "Incoming connection handshake failed");
                    }
                    Err(e) => warn!(peer = %peer, error = %e, "Accept task failed"),
                }
            }
        })
        .await;

        if barrier.is_err() {
            set.abort_all();
            warn!(
                peer = %peer,
                completed = connections.len(),
                requested,
                "Accept timeout, continuing with completed connections"
            );
        }

        if connections.is_empty() {
            return Err(Error::HandshakeTimeout {
                remote: peer.host,
                attempts: 1,
            });
        }

        connections.sort_by_key(|(slot, _)| *slot);
        progress.advance(HandshakeState::Established)?;
        info!(
            peer = %peer,
            established = connections.len(),
            requested,
            "Peer connected"
        );

        Ok(HandshakeOutcome {
            peer,
            connections: connections.into_iter().map(|(_, c)| c).collect(),
            requested,
        })
    }
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptor")
            .field("local", &self.local)
            .field("peers", &self.peer_slots.lock().len())
            .finish_non_exhaustive()
    }
}

/// Accept one connection on `listener`, read its dial packet and echo it.
async fn accept_dial(listener: Box<dyn Listener>, local: PeerAddr) -> Result<Arc<dyn Connection>> {
    let conn = listener.accept().await?;
    drop(listener);

    let packet = recv_message(conn.as_ref()).await?.into_dial_packet()?;
    debug!(
        remote = %packet.local_addr,
        path = ?packet.path.as_ref().map(Path::id),
        "Dial packet received"
    );
    conn.set_path(packet.path.clone());

    send_message(
        conn.as_ref(),
        DialPacket {
            local_addr: local,
            path: packet.path,
        },
    )
    .await?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::path::PathInterface;
    use crate::transport::MemoryNetwork;
    use crate::types::DomainId;

    fn fast_config() -> HandshakeConfig {
        HandshakeConfig {
            dial_retries: 2,
            dial_read_timeout: Duration::from_millis(100),
            accept_timeout: Duration::from_millis(800),
            response_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn path(id: u64) -> Path {
        Path::new(
            vec![
                PathInterface::new(DomainId::new(1, 1), 1),
                PathInterface::new(DomainId::new(1, 10), id),
                PathInterface::new(DomainId::new(1, 2), 1),
            ],
            1500,
        )
    }

    #[test]
    fn test_port_for_slot() {
        let config = HandshakeConfig::default();
        assert_eq!(port_for_slot(&config, 4000, 0, 1).unwrap(), 4000 + 11 + 52);
        assert_eq!(port_for_slot(&config, 4000, 2, 1).unwrap(), 4000 + 33 + 52);
        assert_eq!(port_for_slot(&config, 4000, 0, 2).unwrap(), 4000 + 11 + 104);
        assert!(port_for_slot(&config, 65500, 3, 1).is_err());
        assert!(port_for_slot(&config, 4000, 70000, 1).is_err());
    }

    #[test]
    fn test_state_transitions() {
        use HandshakeState::*;
        assert!(Idle.can_transition_to(HandshakeSent));
        assert!(HandshakeSent.can_transition_to(PortsNegotiated));
        assert!(PortsNegotiated.can_transition_to(Established));
        assert!(Idle.can_transition_to(HandshakeReceived));
        assert!(HandshakeReceived.can_transition_to(DialingBack));
        assert!(DialingBack.can_transition_to(Established));

        assert!(!Idle.can_transition_to(Established));
        assert!(!HandshakeSent.can_transition_to(DialingBack));
        assert!(!Established.can_transition_to(Idle));
    }

    struct Pair {
        network: MemoryNetwork,
        initiator: Initiator,
        acceptor: Arc<Acceptor>,
        base: Box<dyn Listener>,
        server: PeerAddr,
    }

    async fn pair(config: HandshakeConfig) -> Pair {
        let network = MemoryNetwork::new();
        let client: PeerAddr = "1-ff00:0:111,[127.0.0.1]:5000".parse().unwrap();
        let server: PeerAddr = "1-ff00:0:110,[127.0.0.2]:4000".parse().unwrap();

        let client_transport: Arc<dyn Transport> = Arc::new(network.transport(MetricsRegistry::new()));
        let server_transport: Arc<dyn Transport> = Arc::new(network.transport(MetricsRegistry::new()));
        let base = server_transport.listen(server.host).await.unwrap();

        Pair {
            initiator: Initiator::new(client_transport, config.clone(), client),
            acceptor: Arc::new(Acceptor::new(server_transport, config, server)),
            network,
            base,
            server,
        }
    }

    #[tokio::test]
    async fn test_handshake_establishes_all_ports() {
        let p = pair(fast_config()).await;
        let acceptor = Arc::clone(&p.acceptor);
        let base = p.base;
        let server = tokio::spawn(async move {
            let conn = base.accept().await.unwrap();
            acceptor.accept(conn).await
        });

        let paths = vec![path(1), path(2), path(3)];
        let outcome = p.initiator.connect(p.server, &paths).await.unwrap();
        assert_eq!(outcome.connections.len(), 3);
        assert!(!outcome.is_partial());
        for (conn, path) in outcome.connections.iter().zip(&paths) {
            assert_eq!(conn.path_id(), Some(path.id()));
            assert_eq!(conn.remote_addr().ip(), p.server.ip());
        }

        let accepted = server.await.unwrap().unwrap();
        assert_eq!(accepted.peer.port(), 5000);
        assert_eq!(accepted.connections.len(), 3);
        assert_eq!(accepted.connections[1].path_id(), Some(path(2).id()));

        outcome.connections[0].write(b"data").await.unwrap();
        let mut buf = [0u8; 8];
        let n = accepted.connections[0].read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"data");
    }

    #[tokio::test]
    async fn test_partial_establishment_with_down_path() {
        let p = pair(fast_config()).await;
        p.network.set_path_down(path(2).id(), true);

        let acceptor = Arc::clone(&p.acceptor);
        let base = p.base;
        let server = tokio::spawn(async move {
            let conn = base.accept().await.unwrap();
            acceptor.accept(conn).await
        });

        let outcome = p
            .initiator
            .connect(p.server, &[path(1), path(2)])
            .await
            .unwrap();
        assert_eq!(outcome.connections.len(), 1);
        assert!(outcome.is_partial());
        assert_eq!(outcome.connections[0].path_id(), Some(path(1).id()));

        let accepted = server.await.unwrap().unwrap();
        assert_eq!(accepted.connections.len(), 1);
        assert!(accepted.is_partial());
    }

    #[tokio::test]
    async fn test_all_paths_down_fails() {
        let p = pair(fast_config()).await;
        p.network.set_path_down(path(1).id(), true);

        let acceptor = Arc::clone(&p.acceptor);
        let base = p.base;
        let server = tokio::spawn(async move {
            let conn = base.accept().await.unwrap();
            acceptor.accept(conn).await
        });

        let err = p.initiator.connect(p.server, &[path(1)]).await.unwrap_err();
        assert!(matches!(err, Error::HandshakeTimeout { attempts: 2, .. }));

        let err = server.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::HandshakeTimeout { .. }));
    }

    #[tokio::test]
    async fn test_repeated_handshake_reuses_peer_ports() {
        let p = pair(fast_config()).await;
        let acceptor = Arc::clone(&p.acceptor);
        let base = p.base;
        let server = tokio::spawn(async move {
            let mut outcomes = Vec::new();
            for _ in 0..2 {
                let conn = base.accept().await.unwrap();
                outcomes.push(acceptor.accept(conn).await.unwrap());
            }
            outcomes
        });

        let first = p.initiator.connect(p.server, &[path(1)]).await.unwrap();
        let second = p.initiator.connect(p.server, &[path(2)]).await.unwrap();
        assert_eq!(
            first.connections[0].remote_addr(),
            second.connections[0].remote_addr()
        );

        let outcomes = server.await.unwrap();
        assert_eq!(outcomes.len(), 2);
    }

    #[tokio::test]
    async fn test_connect_without_paths() {
        let p = pair(fast_config()).await;
        let err = p.initiator.connect(p.server, &[]).await.unwrap_err();
        assert!(matches!(err, Error::HandshakeFailed(_)));
    }
}
