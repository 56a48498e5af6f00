//! Choice of connection for application reads and writes.
//!
//! A scheduler holds two connection lists handed over by the controller
//! after every reconcile: `listening` (accepted from the peer) and `dialed`
//! (opened by this side over selected paths). The lists are swapped
//! atomically; an I/O call in flight keeps using the connection it picked.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::{Error, Result};
use crate::transport::Connection;
use crate::types::ConnectionId;

/// Frames buffered between the listening connections and `read`.
const INBOX_CAPACITY: usize = 256;

/// Read buffer of a listening connection when no frame size is given.
const DEFAULT_FRAME_SIZE: usize = 64 * 1024;

/// Scheduling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    /// Write on the first dialed connection, read from any listening one.
    #[default]
    FirstPath,
    /// Rotate over all connections of each role.
    RoundRobin,
}

impl SchedulingStrategy {
    /// Build the scheduler; `max_frame_size` bounds the frames it reads.
    pub fn build(self, max_frame_size: usize) -> Arc<dyn Scheduler> {
        match self {
            Self::FirstPath => Arc::new(FirstPathScheduler::with_frame_size(max_frame_size)),
            Self::RoundRobin => Arc::new(RoundRobinScheduler::new()),
        }
    }
}

impl fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstPath => write!(f, "first_path"),
            Self::RoundRobin => write!(f, "round_robin"),
        }
    }
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Replace both connection lists.
    fn set_connections(&self, listening: Vec<Arc<dyn Connection>>, dialed: Vec<Arc<dyn Connection>>);

    /// Read one frame from a listening connection.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write one frame on a dialed connection.
    async fn write(&self, buf: &[u8]) -> Result<usize>;
}

#[derive(Default)]
struct Slots {
    listening: Vec<Arc<dyn Connection>>,
    dialed: Vec<Arc<dyn Connection>>,
}

enum Inbound {
    Frame(Bytes),
    /// The connection failed or was closed by the peer.
    Closed(ConnectionId),
}

/// Writes to `dialed[0]` and reads from whichever listening connection
/// delivers a frame first.
///
/// The peer writes on its own first dialed connection, which is not
/// necessarily the first one accepted here, so every listening connection
/// is drained into a shared inbox. A listening connection that fails is
/// closed and dropped from the read set.
pub struct FirstPathScheduler {
    slots: RwLock<Slots>,
    max_frame_size: usize,
    readers: Mutex<HashMap<ConnectionId, JoinHandle<()>>>,
    inbox_tx: mpsc::Sender<Inbound>,
    inbox: tokio::sync::Mutex<mpsc::Receiver<Inbound>>,
    /// Number of listening connections.
    listening: watch::Sender<usize>,
}

impl FirstPathScheduler {
    pub fn new() -> Self {
        Self::with_frame_size(DEFAULT_FRAME_SIZE)
    }

    pub fn with_frame_size(max_frame_size: usize) -> Self {
        let (inbox_tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let (listening, _) = watch::channel(0);
        Self {
            slots: RwLock::new(Slots::default()),
            max_frame_size: max_frame_size.max(1),
            readers: Mutex::new(HashMap::new()),
            inbox_tx,
            inbox: tokio::sync::Mutex::new(inbox),
            listening,
        }
    }

    fn first_dialed(&self) -> Result<Arc<dyn Connection>> {
        self.slots
            .read()
            .dialed
            .first()
            .cloned()
            .ok_or(Error::NoConnectionAvailable("write"))
    }

    /// Start a reader for every new listening connection and stop the
    /// readers of connections no longer listed.
    fn sync_readers(&self, listening: &[Arc<dyn Connection>]) {
        let mut readers = self.readers.lock();
        readers.retain(|id, handle| {
            let keep = listening.iter().any(|c| c.id() == *id);
            if !keep {
                handle.abort();
            }
            keep
        });
        for conn in listening {
            readers.entry(conn.id()).or_insert_with(|| {
                tokio::spawn(drain_connection(
                    Arc::clone(conn),
                    self.inbox_tx.clone(),
                    self.max_frame_size,
                ))
            });
        }
    }

    /// Drop a failed listening connection. Returns true when it was the last.
    fn remove_listening(&self, id: ConnectionId) -> bool {
        self.readers.lock().remove(&id);
        let mut slots = self.slots.write();
        let before = slots.listening.len();
        slots.listening.retain(|c| c.id() != id);
        let remaining = slots.listening.len();
        self.listening.send_replace(remaining);
        remaining == 0 && before > 0
    }
}

impl Default for FirstPathScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward frames of one listening connection into the inbox until it fails.
async fn drain_connection(
    conn: Arc<dyn Connection>,
    inbox: mpsc::Sender<Inbound>,
    max_frame_size: usize,
) {
    let mut buf = vec![0u8; max_frame_size];
    loop {
        match conn.read(&mut buf).await {
            Ok(n) => {
                let frame = Bytes::copy_from_slice(&buf[..n]);
                if inbox.send(Inbound::Frame(frame)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                trace!(conn = %conn.id(), error = %e, "Listening connection ended");
                let _ = conn.close().await;
                let _ = inbox.send(Inbound::Closed(conn.id())).await;
                return;
            }
        }
    }
}

#[async_trait]
impl Scheduler for FirstPathScheduler {
    fn name(&self) -> &'static str {
        "first_path"
    }

    fn set_connections(&self, listening: Vec<Arc<dyn Connection>>, dialed: Vec<Arc<dyn Connection>>) {
        let listening: Vec<_> = listening.into_iter().filter(|c| !c.is_closed()).collect();
        self.sync_readers(&listening);
        let count = listening.len();
        *self.slots.write() = Slots { listening, dialed };
        self.listening.send_replace(count);
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inbox = self.inbox.lock().await;
        let mut listening = self.listening.subscribe();
        loop {
            let next = match inbox.try_recv() {
                Ok(inbound) => inbound,
                Err(TryRecvError::Disconnected) => return Err(Error::ConnectionClosed),
                Err(TryRecvError::Empty) => {
                    if *listening.borrow_and_update() == 0 {
                        return Err(Error::NoConnectionAvailable("read"));
                    }
                    tokio::select! {
                        inbound = inbox.recv() => inbound.ok_or(Error::ConnectionClosed)?,
                        _ = listening.wait_for(|n| *n == 0) => return Err(Error::ConnectionClosed),
                    }
                }
            };

            match next {
                Inbound::Frame(frame) => {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    return Ok(n);
                }
                Inbound::Closed(id) => {
                    if self.remove_listening(id) {
                        return Err(Error::ConnectionClosed);
                    }
                }
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        let conn = self.first_dialed()?;
        conn.write(buf).await
    }
}

impl Drop for FirstPathScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.readers.get_mut().drain() {
            handle.abort();
        }
    }
}

#[allow(clippy::missing_fields_in_debug)]
impl fmt::Debug for FirstPathScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.read();
        f.debug_struct("FirstPathScheduler")
            .field("listening", &slots.listening.len())
            .field("dialed", &slots.dialed.len())
            .finish()
    }
}

/// Rotates over the connections of each role, one frame per connection.
///
/// Reads follow the same rotation, so this pairs with a round-robin writer
/// on the remote side.
#[derive(Default)]
pub struct RoundRobinScheduler {
    slots: RwLock<Slots>,
    next_read: AtomicUsize,
    next_write: AtomicUsize,
}

impl RoundRobinScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn pick(
        conns: &[Arc<dyn Connection>],
        counter: &AtomicUsize,
        role: &'static str,
    ) -> Result<Arc<dyn Connection>> {
        if conns.is_empty() {
            return Err(Error::NoConnectionAvailable(role));
        }
        let idx = counter.fetch_add(1, Ordering::Relaxed) % conns.len();
        Ok(Arc::clone(&conns[idx]))
    }
}

#[async_trait]
impl Scheduler for RoundRobinScheduler {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn set_connections(&self, listening: Vec<Arc<dyn Connection>>, dialed: Vec<Arc<dyn Connection>>) {
        *self.slots.write() = Slots { listening, dialed };
        self.next_read.store(0, Ordering::Relaxed);
        self.next_write.store(0, Ordering::Relaxed);
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let conn = Self::pick(&self.slots.read().listening, &self.next_read, "read")?;
        conn.read(buf).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        let conn = Self::pick(&self.slots.read().dialed, &self.next_write, "write")?;
        conn.write(buf).await
    }
}

#[allow(clippy::missing_fields_in_debug)]
impl fmt::Debug for RoundRobinScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.read();
        f.debug_struct("RoundRobinScheduler")
            .field("listening", &slots.listening.len())
            .field("dialed", &slots.dialed.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::transport::{MemoryNetwork, Transport};

    async fn pairs(n: usize) -> (Vec<Arc<dyn Connection>>, Vec<Arc<dyn Connection>>) {
        let network = MemoryNetwork::new();
        let transport = network.transport(MetricsRegistry::new());
        let addr: SocketAddr = "127.0.0.1:4300".parse().unwrap();
        let listener = transport.listen(addr).await.unwrap();

        let mut clients = Vec::new();
        let mut servers = Vec::new();
        for _ in 0..n {
            clients.push(transport.dial(None, addr, None).await.unwrap());
            servers.push(listener.accept().await.unwrap());
        }
        (clients, servers)
    }

    #[tokio::test]
    async fn test_empty_scheduler_fails_fast() {
        for scheduler in [SchedulingStrategy::FirstPath.build(1024), SchedulingStrategy::RoundRobin.build(1024)] {
            let mut buf = [0u8; 16];
            let err = scheduler.read(&mut buf).await.unwrap_err();
            assert!(matches!(err, Error::NoConnectionAvailable("read")));
            let err = scheduler.write(b"x").await.unwrap_err();
            assert!(matches!(err, Error::NoConnectionAvailable("write")));
        }
    }

    #[tokio::test]
    async fn test_first_path_writes_index_zero() {
        let (clients, servers) = pairs(2).await;
        let sender = FirstPathScheduler::new();
        sender.set_connections(Vec::new(), clients);

        sender.write(b"one").await.unwrap();
        sender.write(b"two").await.unwrap();

        let mut buf = [0u8; 16];
        let n = servers[0].read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"one");
        let n = servers[0].read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"two");
    }

    #[tokio::test]
    async fn test_first_path_reads_any_listening() {
        let (clients, servers) = pairs(3).await;
        let receiver = FirstPathScheduler::new();
        receiver.set_connections(servers, Vec::new());

        // The peer's first dialed connection is the last one listed here.
        clients[2].write(b"data").await.unwrap();
        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(1), receiver.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"data");

        clients[1].write(b"more").await.unwrap();
        let n = receiver.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"more");
    }

    #[tokio::test]
    async fn test_first_path_drops_closed_listening() {
        let (clients, servers) = pairs(2).await;
        let receiver = FirstPathScheduler::new();
        receiver.set_connections(servers.clone(), Vec::new());

        clients[0].close().await.unwrap();
        clients[1].write(b"alive").await.unwrap();

        let mut buf = [0u8; 16];
        let n = receiver.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"alive");

        // The failed connection is closed locally so the owner can prune it.
        timeout(Duration::from_secs(1), async {
            while !servers[0].is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        clients[1].close().await.unwrap();
        let err = receiver.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert!(matches!(
            receiver.read(&mut buf).await,
            Err(Error::NoConnectionAvailable("read"))
        ));
    }

    #[tokio::test]
    async fn test_first_path_clearing_wakes_reader() {
        let (_clients, servers) = pairs(1).await;
        let receiver = Arc::new(FirstPathScheduler::new());
        receiver.set_connections(servers, Vec::new());

        let reading = Arc::clone(&receiver);
        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            reading.read(&mut buf).await
        });
        tokio::task::yield_now().await;

        receiver.set_connections(Vec::new(), Vec::new());
        let result = timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_round_robin_rotates_writes() {
        let (clients, servers) = pairs(2).await;
        let sender = RoundRobinScheduler::new();
        sender.set_connections(Vec::new(), clients);

        for msg in [b"a", b"b", b"c"] {
            sender.write(msg).await.unwrap();
        }

        let mut buf = [0u8; 4];
        let n = servers[0].read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"a");
        let n = servers[1].read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"b");
        let n = servers[0].read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"c");
    }

    #[tokio::test]
    async fn test_round_robin_pairs_with_round_robin_reader() {
        let (clients, servers) = pairs(3).await;
        let sender = RoundRobinScheduler::new();
        sender.set_connections(Vec::new(), clients);
        let receiver = RoundRobinScheduler::new();
        receiver.set_connections(servers, Vec::new());

        for i in 0u8..6 {
            sender.write(&[i]).await.unwrap();
        }
        let mut buf = [0u8; 1];
        for i in 0u8..6 {
            receiver.read(&mut buf).await.unwrap();
            assert_eq!(buf[0], i);
        }
    }
}
