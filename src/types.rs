//! Core types used throughout panmux.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Routing domain identifier: a 16-bit isolation domain and a 48-bit AS number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DomainId(pub u64);

impl DomainId {
    const AS_BITS: u32 = 48;
    const AS_MASK: u64 = (1 << Self::AS_BITS) - 1;

    pub fn new(isd: u16, asn: u64) -> Self {
        Self((u64::from(isd) << Self::AS_BITS) | (asn & Self::AS_MASK))
    }

    pub fn isd(self) -> u16 {
        (self.0 >> Self::AS_BITS) as u16
    }

    pub fn asn(self) -> u64 {
        self.0 & Self::AS_MASK
    }

    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    fn parse_asn(s: &str) -> Option<u64> {
        if !s.contains(':') {
            let asn: u64 = s.parse().ok()?;
            return (asn <= u64::from(u32::MAX)).then_some(asn);
        }
        let groups: Vec<&str> = s.split(':').collect();
        if groups.len() != 3 {
            return None;
        }
        groups.iter().try_fold(0u64, |acc, g| {
            if g.is_empty() || g.len() > 4 {
                return None;
            }
            let v = u64::from_str_radix(g, 16).ok()?;
            Some((acc << 16) | v)
        })
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let asn = self.asn();
        if asn <= u64::from(u32::MAX) {
            write!(f, "{}-{}", self.isd(), asn)
        } else {
            write!(
                f,
                "{}-{:x}:{:x}:{:x}",
                self.isd(),
                (asn >> 32) & 0xffff,
                (asn >> 16) & 0xffff,
                asn & 0xffff
            )
        }
    }
}

impl FromStr for DomainId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidAddress(format!("invalid domain id: {s}"));
        let (isd, asn) = s.split_once('-').ok_or_else(invalid)?;
        let isd: u16 = isd.parse().map_err(|_| invalid())?;
        let asn = Self::parse_asn(asn).ok_or_else(invalid)?;
        Ok(Self::new(isd, asn))
    }
}

/// Address of a peer in the path-aware network: its domain plus a host socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    pub domain: DomainId,
    pub host: SocketAddr,
}

impl PeerAddr {
    pub fn new(domain: DomainId, host: SocketAddr) -> Self {
        Self { domain, host }
    }

    /// Same peer, different port.
    pub fn with_port(self, port: u16) -> Self {
        Self {
            domain: self.domain,
            host: SocketAddr::new(self.host.ip(), port),
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.host.ip()
    }

    pub fn port(&self) -> u16 {
        self.host.port()
    }

    /// Database key of this peer.
    pub fn key(&self) -> PeerKey {
        PeerKey::of(self)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},[{}]:{}", self.domain, self.host.ip(), self.host.port())
    }
}

impl FromStr for PeerAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidAddress(s.to_string());
        let (domain, host) = s.split_once(',').ok_or_else(invalid)?;
        let domain: DomainId = domain.trim().parse()?;

        let (ip, port) = host.trim().rsplit_once(':').ok_or_else(invalid)?;
        let ip = ip.trim_start_matches('[').trim_end_matches(']');
        let ip: IpAddr = ip.parse().map_err(|_| invalid())?;
        let port: u16 = port.parse().map_err(|_| invalid())?;

        Ok(Self::new(domain, SocketAddr::new(ip, port)))
    }
}

/// Hash of a peer address, used to index the path quality database.
///
/// Collisions are not resolved: two addresses with the same key share one
/// database entry. With a 64-bit blake3 truncation this is negligible for
/// any realistic number of peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey(pub u64);

impl PeerKey {
    pub fn of(addr: &PeerAddr) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&addr.domain.to_be_bytes());
        match addr.host.ip() {
            IpAddr::V4(ip) => hasher.update(&ip.octets()),
            IpAddr::V6(ip) => hasher.update(&ip.octets()),
        };
        hasher.update(&addr.host.port().to_be_bytes());

        let digest = hasher.finalize();
        let mut key = [0u8; 8];
        key.copy_from_slice(&digest.as_bytes()[..8]);
        Self(u64::from_be_bytes(key))
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.to_be_bytes()))
    }
}

/// Role of a connection within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Accepted from the peer
    Incoming,
    /// Dialed towards the peer
    Outgoing,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incoming => write!(f, "incoming"),
            Self::Outgoing => write!(f, "outgoing"),
        }
    }
}

/// Lifecycle state of a connection in a connection set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Bound to a path of the current selection
    Active,
    /// Path dropped by the last reselection, closed on the next one
    Stale,
    /// Closed
    Closed,
}

impl ConnectionState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Stale => write!(f, "stale"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Bandwidth measurement.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize, Default)]
pub struct Bandwidth {
    /// Bytes per second
    pub bytes_per_sec: f64,
}

impl Bandwidth {
    pub const ZERO: Self = Self { bytes_per_sec: 0.0 };

    pub fn from_bps(bytes_per_sec: f64) -> Self {
        Self { bytes_per_sec }
    }

    pub fn as_mbps(self) -> f64 {
        self.bytes_per_sec / 125_000.0
    }

    pub fn as_human_readable(self) -> String {
        let bps = self.bytes_per_sec * 8.0;
        if bps >= 1_000_000_000.0 {
            let gbps = bps / 1_000_000_000.0;
            format!("{gbps:.2} Gbps")
        } else if bps >= 1_000_000.0 {
            let mbps = bps / 1_000_000.0;
            format!("{mbps:.2} Mbps")
        } else if bps >= 1_000.0 {
            let kbps = bps / 1_000.0;
            format!("{kbps:.2} Kbps")
        } else {
            format!("{bps:.0} bps")
        }
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_human_readable())
    }
}
