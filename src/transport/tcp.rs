//! TCP transport implementation.
//!
//! Frames are written as a 4-byte big-endian length followed by the payload.
//! The read and write halves of a stream are locked independently so a
//! pending read never blocks a writer.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::debug;

use super::socket::bind_tcp_socket;
use super::{
    unspecified_for, wait_closed, Connection, Listener, Transport, TransportConfig, TransportKind,
};
use crate::error::{Error, Result, TransportError};
use crate::metrics::{ConnMetrics, MetricsRegistry};
use crate::path::Path;
use crate::types::{ConnectionId, Direction};

/// TCP transport.
pub struct TcpTransport {
    config: TransportConfig,
    registry: MetricsRegistry,
}

impl TcpTransport {
    /// Create a new TCP transport registering connections in `registry`.
    pub fn new(config: TransportConfig, registry: MetricsRegistry) -> Self {
        Self { config, registry }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self, local: SocketAddr) -> Result<Box<dyn Listener>> {
        let socket = bind_tcp_socket(local, &self.config)?;

        socket.listen(1024).map_err(|e| TransportError::BindFailed {
            addr: local,
            reason: e.to_string(),
        })?;

        // Convert socket2::Socket to std::net::TcpListener then to tokio
        let std_listener: std::net::TcpListener = socket.into();
        let listener =
            TcpListener::from_std(std_listener).map_err(|e| TransportError::BindFailed {
                addr: local,
                reason: e.to_string(),
            })?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::SocketError(e.to_string()))?;

        debug!(%local_addr, "TCP listener bound");

        Ok(Box::new(TcpListenerHandle {
            listener,
            local_addr,
            config: self.config.clone(),
            registry: self.registry.clone(),
        }))
    }

    async fn dial(
        &self,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        path: Option<Path>,
    ) -> Result<Arc<dyn Connection>> {
        let bind = local.unwrap_or_else(|| unspecified_for(remote));

        let socket = if remote.is_ipv6() {
            tokio::net::TcpSocket::new_v6()
        } else {
            tokio::net::TcpSocket::new_v4()
        }
        .map_err(|e| TransportError::Tcp(e.to_string()))?;

        socket
            .set_reuseaddr(self.config.reuse_addr)
            .map_err(|e| TransportError::Tcp(e.to_string()))?;

        socket.bind(bind).map_err(|e| TransportError::BindFailed {
            addr: bind,
            reason: e.to_string(),
        })?;

        let stream = timeout(self.config.connect_timeout, socket.connect(remote))
            .await
            .map_err(|_| Error::ConnectionTimeout)?
            .map_err(|e| Error::ConnectionFailed {
                addr: remote,
                reason: e.to_string(),
            })?;

        let conn = TcpConnection::new(
            stream,
            Direction::Outgoing,
            path,
            &self.registry,
            &self.config,
        )?;
        Ok(Arc::new(conn))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }
}

/// Listening TCP socket.
pub struct TcpListenerHandle {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: TransportConfig,
    registry: MetricsRegistry,
}

#[async_trait]
impl Listener for TcpListenerHandle {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept(&self) -> Result<Arc<dyn Connection>> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| TransportError::Tcp(e.to_string()))?;

        debug!(local = %self.local_addr, remote = %addr, "Accepted TCP connection");

        let conn = TcpConnection::new(
            stream,
            Direction::Incoming,
            None,
            &self.registry,
            &self.config,
        )?;
        Ok(Arc::new(conn))
    }
}

/// One TCP stream carrying length-prefixed frames.
pub struct TcpConnection {
    id: ConnectionId,
    direction: Direction,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    path: RwLock<Option<Path>>,
    metrics: Arc<ConnMetrics>,
    registry: MetricsRegistry,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    max_frame_size: usize,
    closed: watch::Sender<bool>,
}

impl TcpConnection {
    fn new(
        stream: TcpStream,
        direction: Direction,
        path: Option<Path>,
        registry: &MetricsRegistry,
        config: &TransportConfig,
    ) -> Result<Self> {
        if config.tcp_nodelay {
            stream
                .set_nodelay(true)
                .map_err(|e| TransportError::Tcp(e.to_string()))?;
        }

        let local_addr = stream
            .local_addr()
            .map_err(|e| TransportError::SocketError(e.to_string()))?;
        let remote_addr = stream
            .peer_addr()
            .map_err(|e| TransportError::SocketError(e.to_string()))?;

        let id = ConnectionId::new();
        let (reader, writer) = stream.into_split();
        let (closed, _) = watch::channel(false);

        Ok(Self {
            id,
            direction,
            local_addr,
            remote_addr,
            path: RwLock::new(path),
            metrics: registry.register(id),
            registry: registry.clone(),
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(writer)),
            max_frame_size: config.max_frame_size,
            closed,
        })
    }

    async fn read_frame(reader: &mut OwnedReadHalf, max: usize) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        if let Err(e) = reader.read_exact(&mut len_buf).await {
            return Err(if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::ConnectionClosed
            } else {
                TransportError::ReceiveFailed(e.to_string()).into()
            });
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > max {
            return Err(TransportError::FrameTooLarge { size: len, max }.into());
        }

        let mut frame = vec![0u8; len];
        reader
            .read_exact(&mut frame)
            .await
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
        Ok(frame)
    }
}

#[async_trait]
impl Connection for TcpConnection {
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

        let mut reader = self.reader.lock().await;
        tokio::select! {
            () = wait_closed(closed) => Err(Error::ConnectionClosed),
            frame = Self::read_frame(&mut reader, self.max_frame_size) => {
                let frame = frame?;
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

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::ConnectionClosed)?;

        // Write length prefix (4 bytes, big-endian) then data
        let len = buf.len() as u32;
        writer
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        writer
            .write_all(buf)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        self.metrics.record_write(buf.len());
        Ok(buf.len())
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        self.registry.unregister(&self.id);
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[allow(clippy::missing_fields_in_debug)]
impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("local", &self.local_addr)
            .field("remote", &self.remote_addr)
            .field("path", &self.path.read().as_ref().map(Path::id))
            .finish()
    }
}
