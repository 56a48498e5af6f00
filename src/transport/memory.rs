//! In-process transport.
//!
//! A [`MemoryNetwork`] is a registry of listening addresses shared by any
//! number of [`MemoryTransport`]s. Dialing creates a pair of bounded frame
//! channels. Paths can be marked down, in which case frames written over a
//! connection bound to such a path are silently dropped.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::trace;

use super::{wait_closed, Connection, Listener, Transport, TransportConfig, TransportKind};
use crate::error::{Error, Result, TransportError};
use crate::metrics::{ConnMetrics, MetricsRegistry};
use crate::path::{Path, PathId};
use crate::types::{ConnectionId, Direction};

/// Frames buffered per direction before writers wait.
const FRAME_QUEUE: usize = 1024;

/// First port handed out for unbound endpoints.
const EPHEMERAL_BASE: u16 = 49152;

struct ListenerEntry {
    incoming: mpsc::Sender<Arc<MemoryConnection>>,
    registry: MetricsRegistry,
}

#[derive(Default)]
struct NetworkInner {
    listeners: DashMap<SocketAddr, ListenerEntry>,
    down: Arc<DashSet<PathId>>,
    next_port: AtomicU16,
}

/// Shared in-process network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport attached to this network.
    pub fn transport(&self, registry: MetricsRegistry) -> MemoryTransport {
        let config = TransportConfig {
            kind: TransportKind::Memory,
            ..Default::default()
        };
        self.transport_with_config(registry, config)
    }

    pub fn transport_with_config(
        &self,
        registry: MetricsRegistry,
        config: TransportConfig,
    ) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            registry,
            max_frame_size: config.max_frame_size,
        }
    }

    /// Mark a path as down (frames over it are dropped) or up again.
    pub fn set_path_down(&self, id: PathId, down: bool) {
        if down {
            self.inner.down.insert(id);
        } else {
            self.inner.down.remove(&id);
        }
    }

    pub fn is_path_down(&self, id: &PathId) -> bool {
        self.inner.down.contains(id)
    }

    pub fn is_listening(&self, addr: &SocketAddr) -> bool {
        self.inner.listeners.contains_key(addr)
    }

    fn ephemeral(&self, like: SocketAddr) -> SocketAddr {
        let offset =
            self.inner.next_port.fetch_add(1, Ordering::Relaxed) % (u16::MAX - EPHEMERAL_BASE);
        let ip = if like.is_ipv6() {
            IpAddr::V6(Ipv6Addr::LOCALHOST)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };
        SocketAddr::new(ip, EPHEMERAL_BASE + offset)
    }
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("listeners", &self.inner.listeners.len())
            .field("down_paths", &self.inner.down.len())
            .finish()
    }
}

/// Transport over a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    registry: MetricsRegistry,
    max_frame_size: usize,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(&self, local: SocketAddr) -> Result<Box<dyn Listener>> {
        let addr = if local.port() == 0 {
            self.network.ephemeral(local)
        } else {
            local
        };

        let (tx, rx) = mpsc::channel(FRAME_QUEUE);
        match self.network.inner.listeners.entry(addr) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TransportError::AddressInUse(addr).into());
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ListenerEntry {
                    incoming: tx,
                    registry: self.registry.clone(),
                });
            }
        }

        trace!(%addr, "Memory listener bound");
        Ok(Box::new(MemoryListener {
            addr,
            incoming: AsyncMutex::new(rx),
            network: self.network.clone(),
        }))
    }

    async fn dial(
        &self,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        path: Option<Path>,
    ) -> Result<Arc<dyn Connection>> {
        let (incoming, remote_registry) = self
            .network
            .inner
            .listeners
            .get(&remote)
            .map(|entry| (entry.incoming.clone(), entry.registry.clone()))
            .ok_or(TransportError::Unreachable(remote))?;

        let local = local.unwrap_or_else(|| self.network.ephemeral(remote));
        let (client_tx, server_rx) = mpsc::channel(FRAME_QUEUE);
        let (server_tx, client_rx) = mpsc::channel(FRAME_QUEUE);
        let down = self.network.inner.down.clone();

        let client = Arc::new(MemoryConnection::new(
            Endpoint {
                direction: Direction::Outgoing,
                local,
                remote,
                path,
            },
            client_tx,
            client_rx,
            &self.registry,
            down.clone(),
            self.max_frame_size,
        ));
        let server = Arc::new(MemoryConnection::new(
            Endpoint {
                direction: Direction::Incoming,
                local: remote,
                remote: local,
                path: None,
            },
            server_tx,
            server_rx,
            &remote_registry,
            down,
            self.max_frame_size,
        ));

        incoming
            .send(server)
            .await
            .map_err(|_| TransportError::Unreachable(remote))?;

        Ok(client)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }
}

/// Listening endpoint on a [`MemoryNetwork`]. Unbinds on drop.
pub struct MemoryListener {
    addr: SocketAddr,
    incoming: AsyncMutex<mpsc::Receiver<Arc<MemoryConnection>>>,
    network: MemoryNetwork,
}

#[async_trait]
impl Listener for MemoryListener {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn accept(&self) -> Result<Arc<dyn Connection>> {
        let conn = self
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ConnectionClosed)?;
        Ok(conn)
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.inner.listeners.remove(&self.addr);
    }
}

struct Endpoint {
    direction: Direction,
    local: SocketAddr,
    remote: SocketAddr,
    path: Option<Path>,
}

/// One side of an in-process connection.
pub struct MemoryConnection {
    id: ConnectionId,
    direction: Direction,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    path: RwLock<Option<Path>>,
    metrics: Arc<ConnMetrics>,
    registry: MetricsRegistry,
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    rx: AsyncMutex<mpsc::Receiver<Bytes>>,
    down: Arc<DashSet<PathId>>,
    max_frame_size: usize,
    closed: watch::Sender<bool>,
}

impl MemoryConnection {
    fn new(
        endpoint: Endpoint,
        tx: mpsc::Sender<Bytes>,
        rx: mpsc::Receiver<Bytes>,
        registry: &MetricsRegistry,
        down: Arc<DashSet<PathId>>,
        max_frame_size: usize,
    ) -> Self {
        let id = ConnectionId::new();
        let (closed, _) = watch::channel(false);
        Self {
            id,
            direction: endpoint.direction,
            local_addr: endpoint.local,
            remote_addr: endpoint.remote,
            path: RwLock::new(endpoint.path),
            metrics: registry.register(id),
            registry: registry.clone(),
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
            down,
            max_frame_size,
            closed,
        }
    }

    fn path_is_down(&self) -> bool {
        self.path
            .read()
            .as_ref()
            .is_some_and(|p| self.down.contains(&p.id()))
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn path(&self) -> Option<Path> {
        self.path.read().clone()
    }

    fn set_path(&self, path: Option<Path>) {
        *self.path.write() = path;
    }

    fn metrics(&self) -> Arc<ConnMetrics> {
        self.metrics.clone()
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let closed = self.closed.subscribe();
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let mut rx = self.rx.lock().await;
        tokio::select! {
            () = wait_closed(closed) => Err(Error::ConnectionClosed),
            frame = rx.recv() => {
                let frame = frame.ok_or(Error::ConnectionClosed)?;
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                self.metrics.record_read(frame.len());
                Ok(n)
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: buf.len(),
                max: self.max_frame_size,
            }
            .into());
        }

        let tx = self.tx.lock().clone().ok_or(Error::ConnectionClosed)?;

        if self.path_is_down() {
            trace!(conn = %self.id, "Path down, dropping frame");
        } else {
            tx.send(Bytes::copy_from_slice(buf))
                .await
                .map_err(|_| Error::ConnectionClosed)?;
        }

        self.metrics.record_write(buf.len());
        Ok(buf.len())
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        self.tx.lock().take();
        self.registry.unregister(&self.id);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[allow(clippy::missing_fields_in_debug)]
impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("local", &self.local_addr)
            .field("remote", &self.remote_addr)
            .field("path", &self.path.read().as_ref().map(Path::id))
            .finish()
    }
}
