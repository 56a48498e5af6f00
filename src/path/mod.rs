//! Paths through the path-aware network and the topology lookup seam.
//!
//! A [`Path`] is an immutable, explicit route to a peer: an ordered list of
//! interfaces, an MTU and per-hop latency metadata. Its [`PathId`] is derived
//! from the raw hop encoding, so the same physical path returned by two
//! separate topology queries always compares equal.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::types::{DomainId, PeerAddr, PeerKey};

/// One interface crossed by a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathInterface {
    pub domain: DomainId,
    pub id: u64,
}

impl PathInterface {
    pub fn new(domain: DomainId, id: u64) -> Self {
        Self { domain, id }
    }
}

/// Stable path fingerprint (blake3 of the raw hop encoding).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathId(pub [u8; 32]);

impl PathId {
    pub fn of_raw(raw: &[u8]) -> Self {
        Self(*blake3::hash(raw).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..6]))
    }
}

impl fmt::Debug for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathId({self})")
    }
}

#[derive(Serialize, Deserialize)]
struct PathRepr {
    interfaces: Vec<PathInterface>,
    mtu: u16,
    latencies: Vec<Option<Duration>>,
    raw: Vec<u8>,
}

/// An explicit route to a peer.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "PathRepr", into = "PathRepr")]
pub struct Path {
    id: PathId,
    interfaces: Vec<PathInterface>,
    mtu: u16,
    /// Per-hop latency; `None` means not measured.
    latencies: Vec<Option<Duration>>,
    raw: Vec<u8>,
}

impl Path {
    /// Create a new path, deriving the raw encoding from the interface list.
    pub fn new(interfaces: Vec<PathInterface>, mtu: u16) -> Self {
        let mut raw = Vec::with_capacity(interfaces.len() * 16);
        for intf in &interfaces {
            raw.extend_from_slice(&intf.domain.to_be_bytes());
            raw.extend_from_slice(&intf.id.to_be_bytes());
        }
        Self::from_raw(raw, interfaces, mtu, Vec::new())
    }

    /// Create a path from a raw forwarding encoding supplied by the topology service.
    pub fn from_raw(
        raw: Vec<u8>,
        interfaces: Vec<PathInterface>,
        mtu: u16,
        latencies: Vec<Option<Duration>>,
    ) -> Self {
        Self {
            id: PathId::of_raw(&raw),
            interfaces,
            mtu,
            latencies,
            raw,
        }
    }

    /// Attach per-hop latency metadata. Does not change the id.
    #[must_use]
    pub fn with_latencies(mut self, latencies: Vec<Option<Duration>>) -> Self {
        self.latencies = latencies;
        self
    }

    pub fn id(&self) -> PathId {
        self.id
    }

    pub fn interfaces(&self) -> &[PathInterface] {
        &self.interfaces
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn latencies(&self) -> &[Option<Duration>] {
        &self.latencies
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn hop_count(&self) -> usize {
        self.interfaces.len()
    }

    /// Sum of the measured hop latencies. Unmeasured hops count as zero.
    pub fn total_latency(&self) -> Duration {
        self.latencies.iter().flatten().sum()
    }

    /// Interfaces between the two access links.
    pub fn interior_interfaces(&self) -> &[PathInterface] {
        match self.interfaces.len() {
            0..=2 => &[],
            n => &self.interfaces[1..n - 1],
        }
    }
}

impl PartialEq for Path {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Path {}

impl std::hash::Hash for Path {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl From<PathRepr> for Path {
    fn from(repr: PathRepr) -> Self {
        Self::from_raw(repr.raw, repr.interfaces, repr.mtu, repr.latencies)
    }
}

impl From<Path> for PathRepr {
    fn from(path: Path) -> Self {
        Self {
            interfaces: path.interfaces,
            mtu: path.mtu,
            latencies: path.latencies,
            raw: path.raw,
        }
    }
}

// Renders `[1-ff00:0:110 1>2 1-ff00:0:111 3>4 1-ff00:0:112]`.
impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let intfs = &self.interfaces;
        let (Some(first), Some(last)) = (intfs.first(), intfs.last()) else {
            return write!(f, "[]");
        };

        write!(f, "[{} {}", first.domain, first.id)?;
        let mut i = 1;
        while i + 1 < intfs.len() {
            let (inbound, outbound) = (intfs[i], intfs[i + 1]);
            write!(f, ">{} {} {}", inbound.id, inbound.domain, outbound.id)?;
            i += 2;
        }
        write!(f, ">{} {}]", last.id, last.domain)
    }
}

// Abbreviated: the raw encoding is not useful in logs.
#[allow(clippy::missing_fields_in_debug)]
impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Path")
            .field("id", &self.id)
            .field("hops", &self.to_string())
            .field("mtu", &self.mtu)
            .finish()
    }
}

/// Canonical identity of a path combination: the sorted set of its path ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PathSetKey(Vec<PathId>);

impl PathSetKey {
    pub fn new(ids: impl IntoIterator<Item = PathId>) -> Self {
        let ids: BTreeSet<PathId> = ids.into_iter().collect();
        Self(ids.into_iter().collect())
    }

    pub fn ids(&self) -> &[PathId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PathSetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{{{}}}", ids.join("|"))
    }
}

/// Topology query service: all currently known paths to a peer.
#[async_trait]
pub trait PathLookup: Send + Sync {
    async fn lookup_paths(&self, peer: &PeerAddr) -> anyhow::Result<Vec<Path>>;
}

/// In-memory topology, used where no path service is available.
#[derive(Default)]
pub struct StaticTopology {
    paths: DashMap<PeerKey, Vec<Path>>,
    failing: AtomicBool,
}

impl StaticTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the paths known for a peer.
    pub fn set_paths(&self, peer: &PeerAddr, paths: Vec<Path>) {
        self.paths.insert(peer.key(), paths);
    }

    /// Append one path for a peer.
    pub fn add_path(&self, peer: &PeerAddr, path: Path) {
        self.paths.entry(peer.key()).or_default().push(path);
    }

    /// Remove a path from a peer's topology.
    pub fn remove_path(&self, peer: &PeerAddr, id: PathId) {
        if let Some(mut paths) = self.paths.get_mut(&peer.key()) {
            paths.retain(|p| p.id() != id);
        }
    }

    /// Make every subsequent lookup fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl PathLookup for StaticTopology {
    async fn lookup_paths(&self, peer: &PeerAddr) -> anyhow::Result<Vec<Path>> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("path service unavailable");
        }
        self.paths
            .get(&peer.key())
            .map(|paths| paths.clone())
            .ok_or_else(|| anyhow::anyhow!("no route to {peer}"))
    }
}
