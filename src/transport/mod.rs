//! Transport layer for panmux.
//!
//! The session layer only needs a small capability surface from the
//! underlying network: listen on an address, dial a remote address over a
//! given path, and exchange frames on the resulting connection. Concrete
//! variants are selected by [`TransportKind`] at construction:
//!
//! - `tcp`: tokio TCP streams with 4-byte length-prefixed frames
//! - `memory`: an in-process [`MemoryNetwork`], used by tests and demos
//!
//! Every connection registers its [`ConnMetrics`] in the [`MetricsRegistry`]
//! injected into the transport.

mod memory;
mod socket;
mod tcp;

pub use memory::{MemoryConnection, MemoryListener, MemoryNetwork, MemoryTransport};
pub use socket::bind_tcp_socket;
pub use tcp::{TcpConnection, TcpListenerHandle, TcpTransport};

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::metrics::{ConnMetrics, MetricsRegistry};
use crate::path::{Path, PathId};
use crate::types::{ConnectionId, Direction};

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Transport variant.
    #[serde(default)]
    pub kind: TransportKind,

    /// Connection timeout.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Largest frame accepted on a connection.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Send buffer size in bytes.
    #[serde(default = "default_send_buffer")]
    pub send_buffer_size: usize,

    /// Receive buffer size in bytes.
    #[serde(default = "default_recv_buffer")]
    pub recv_buffer_size: usize,

    /// Enable TCP_NODELAY.
    #[serde(default = "default_nodelay")]
    pub tcp_nodelay: bool,

    /// Enable SO_REUSEADDR.
    #[serde(default = "default_reuse_addr")]
    pub reuse_addr: bool,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_max_frame_size() -> usize {
    64 * 1024
}
fn default_send_buffer() -> usize {
    2 * 1024 * 1024
} // 2 MB
fn default_recv_buffer() -> usize {
    2 * 1024 * 1024
} // 2 MB
fn default_nodelay() -> bool {
    true
}
fn default_reuse_addr() -> bool {
    true
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            connect_timeout: default_connect_timeout(),
            max_frame_size: default_max_frame_size(),
            send_buffer_size: default_send_buffer(),
            recv_buffer_size: default_recv_buffer(),
            tcp_nodelay: default_nodelay(),
            reuse_addr: default_reuse_addr(),
        }
    }
}

/// Transport variant selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// TCP streams with length-prefixed frames.
    #[default]
    Tcp,
    /// In-process network.
    Memory,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// A live, framed connection to a peer.
///
/// Reads and writes are frame oriented: each `write` sends one frame and
/// each `read` returns one frame. A frame larger than the read buffer is
/// truncated to fit.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Stable connection identifier.
    fn id(&self) -> ConnectionId;

    fn direction(&self) -> Direction;

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;

    /// Path this connection is bound to, if any.
    fn path(&self) -> Option<Path>;

    /// Rebind the connection to another path.
    fn set_path(&self, path: Option<Path>);

    fn path_id(&self) -> Option<PathId> {
        self.path().map(|p| p.id())
    }

    /// Per-connection traffic counters.
    fn metrics(&self) -> Arc<ConnMetrics>;

    /// Receive one frame.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Send one frame.
    async fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Close the connection. Pending reads return `ConnectionClosed`.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Accepts incoming connections on one local address.
#[async_trait]
pub trait Listener: Send + Sync {
    fn local_addr(&self) -> SocketAddr;

    /// Wait for the next incoming connection.
    async fn accept(&self) -> Result<Arc<dyn Connection>>;
}

/// Factory for listeners and dialed connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start listening on a local address.
    async fn listen(&self, local: SocketAddr) -> Result<Box<dyn Listener>>;

    /// Dial a remote address, binding the new connection to `path`.
    async fn dial(
        &self,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        path: Option<Path>,
    ) -> Result<Arc<dyn Connection>>;

    fn kind(&self) -> TransportKind;

    /// Registry new connections register their metrics in.
    fn registry(&self) -> &MetricsRegistry;
}

/// Create a transport of the configured kind.
///
/// A memory transport attaches to `network` when given, otherwise to a new
/// private network.
pub fn create_transport(
    config: &TransportConfig,
    registry: MetricsRegistry,
    network: Option<MemoryNetwork>,
) -> Arc<dyn Transport> {
    match config.kind {
        TransportKind::Tcp => Arc::new(TcpTransport::new(config.clone(), registry)),
        TransportKind::Memory => {
            let network = network.unwrap_or_default();
            Arc::new(network.transport(registry))
        }
    }
}

/// Unspecified local address matching the family of `remote`.
pub(crate) fn unspecified_for(remote: SocketAddr) -> SocketAddr {
    if remote.is_ipv6() {
        SocketAddr::from(([0u16; 8], 0))
    } else {
        SocketAddr::from(([0u8; 4], 0))
    }
}

/// Resolve once the close flag behind `rx` is set.
pub(crate) async fn wait_closed(mut rx: tokio::sync::watch::Receiver<bool>) {
    loop {
        let closed = *rx.borrow_and_update();
        if closed || rx.changed().await.is_err() {
            return;
        }
    }
}
