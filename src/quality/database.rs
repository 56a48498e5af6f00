//! Per-peer store of known paths and their accumulated metrics.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{PathQuality, PathSet};
use crate::error::{Error, Result};
use crate::metrics::{BandwidthSample, MetricsSnapshot};
use crate::path::{PathId, PathLookup};
use crate::transport::Connection;
use crate::types::{PeerAddr, PeerKey};

/// Path quality database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Bandwidth samples kept per path.
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,

    /// Consecutive refreshes a path may be missing before it is dropped.
    #[serde(default = "default_max_absences")]
    pub max_absences: u32,
}

fn default_max_samples() -> usize {
    600
}
fn default_max_absences() -> u32 {
    3
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_samples: default_max_samples(),
            max_absences: default_max_absences(),
        }
    }
}

struct PeerEntry {
    set: PathSet,
    /// At least one refresh succeeded.
    refreshed: bool,
    listening: Vec<Arc<dyn Connection>>,
    dialed: Vec<Arc<dyn Connection>>,
}

impl PeerEntry {
    fn new(peer: PeerAddr) -> Self {
        Self {
            set: PathSet::empty(peer),
            refreshed: false,
            listening: Vec::new(),
            dialed: Vec::new(),
        }
    }
}

/// Store of all known paths per peer.
///
/// Each peer's state sits behind its own lock, so a refresh merge or a
/// metrics tick for one peer never blocks another. Readers always observe
/// either the previous or the fully merged set.
pub struct PathQualityDatabase {
    lookup: Arc<dyn PathLookup>,
    peers: DashMap<PeerKey, Arc<RwLock<PeerEntry>>>,
    config: DatabaseConfig,
}

impl PathQualityDatabase {
    /// Create a new database querying `lookup` for topology.
    pub fn new(lookup: Arc<dyn PathLookup>, config: DatabaseConfig) -> Self {
        Self {
            lookup,
            peers: DashMap::new(),
            config,
        }
    }

    fn entry(&self, peer: &PeerAddr) -> Arc<RwLock<PeerEntry>> {
        self.peers
            .entry(peer.key())
            .or_insert_with(|| Arc::new(RwLock::new(PeerEntry::new(*peer))))
            .clone()
    }

    fn existing(&self, peer: &PeerAddr) -> Option<Arc<RwLock<PeerEntry>>> {
        self.peers.get(&peer.key()).map(|e| e.clone())
    }

    /// Re-query the topology for `peer` and merge the result with history.
    ///
    /// Entries whose id reappears keep their metrics. New paths get fresh
    /// entries. Paths missing from the query are kept until they have been
    /// absent `max_absences` times in a row. On lookup failure the previous
    /// set is left untouched.
    pub async fn refresh(&self, peer: &PeerAddr) -> Result<()> {
        let fresh = self
            .lookup
            .lookup_paths(peer)
            .await
            .map_err(|e| Error::LookupFailed {
                peer: *peer,
                reason: e.to_string(),
            })?;

        let entry = self.entry(peer);
        let mut entry = entry.write();
        let now = Instant::now();

        let mut previous: HashMap<PathId, PathQuality> = HashMap::new();
        let mut previous_order = Vec::with_capacity(entry.set.len());
        for quality in entry.set.paths.drain(..) {
            previous_order.push(quality.id());
            previous.insert(quality.id(), quality);
        }

        let mut merged = Vec::with_capacity(fresh.len());
        let mut seen = HashSet::new();
        let mut added = 0usize;
        for path in fresh {
            if !seen.insert(path.id()) {
                continue;
            }
            let quality = match previous.remove(&path.id()) {
                Some(mut existing) => {
                    existing.path = path;
                    existing.last_seen = now;
                    existing.absent_rounds = 0;
                    existing
                }
                None => {
                    added += 1;
                    PathQuality::new(path, self.config.max_samples)
                }
            };
            merged.push(quality);
        }

        let mut dropped = 0usize;
        for id in previous_order {
            let Some(mut missing) = previous.remove(&id) else {
                continue;
            };
            missing.absent_rounds += 1;
            if missing.absent_rounds >= self.config.max_absences {
                debug!(%peer, path = %missing.path, "Dropping path missing from topology");
                dropped += 1;
            } else {
                merged.push(missing);
            }
        }

        entry.set.peer = *peer;
        entry.set.paths = merged;
        entry.refreshed = true;

        debug!(
            %peer,
            paths = entry.set.len(),
            added,
            dropped,
            "Refreshed path set"
        );
        Ok(())
    }

    /// Current merged path set of `peer`.
    pub fn get_path_set(&self, peer: &PeerAddr) -> Result<PathSet> {
        let entry = self.existing(peer).ok_or(Error::NotFound(*peer))?;
        let entry = entry.read();
        if !entry.refreshed {
            return Err(Error::NotFound(*peer));
        }
        Ok(entry.set.clone())
    }

    /// Register the live connections of a peer for metrics collection.
    pub fn set_connections(
        &self,
        peer: &PeerAddr,
        listening: Vec<Arc<dyn Connection>>,
        dialed: Vec<Arc<dyn Connection>>,
    ) {
        let entry = self.entry(peer);
        let mut entry = entry.write();
        entry.listening = listening;
        entry.dialed = dialed;
    }

    /// Advance the metrics of every registered connection by one tick.
    pub fn record_metrics(&self, interval: Duration) {
        let entries: Vec<_> = self.peers.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            Self::record_entry(&entry, interval);
        }
    }

    /// Advance the metrics of one peer's connections by one tick.
    pub fn record_peer_metrics(&self, peer: &PeerAddr, interval: Duration) {
        if let Some(entry) = self.existing(peer) {
            Self::record_entry(&entry, interval);
        }
    }

    fn record_entry(entry: &RwLock<PeerEntry>, interval: Duration) {
        // Connections present at the start of the tick.
        let conns: Vec<Arc<dyn Connection>> = {
            let entry = entry.read();
            entry
                .listening
                .iter()
                .chain(entry.dialed.iter())
                .cloned()
                .collect()
        };

        let mut per_path: HashMap<PathId, (BandwidthSample, MetricsSnapshot)> = HashMap::new();
        for conn in conns {
            if conn.is_closed() {
                continue;
            }
            let Some(id) = conn.path_id() else {
                continue;
            };
            let tick = conn.metrics().tick(interval);
            trace!(conn = %conn.id(), path = %id, read = tick.sample.read, write = tick.sample.write, "Metrics tick");

            let slot = per_path.entry(id).or_default();
            slot.0 = slot.0.saturating_add(tick.sample);
            slot.1 = slot.1 + tick.delta;
        }

        if per_path.is_empty() {
            return;
        }

        let mut entry = entry.write();
        for quality in &mut entry.set.paths {
            if let Some((sample, delta)) = per_path.get(&quality.id()) {
                quality.metrics.record(*sample, *delta);
            }
        }
    }

    /// Forget everything about a peer.
    pub fn remove_peer(&self, peer: &PeerAddr) {
        if self.peers.remove(&peer.key()).is_none() {
            warn!(%peer, "Removing unknown peer");
        }
    }

    /// Peers with at least one successful refresh.
    pub fn peers(&self) -> Vec<PeerAddr> {
        self.peers
            .iter()
            .filter_map(|e| {
                let entry = e.value().read();
                entry.refreshed.then_some(entry.set.peer)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl fmt::Debug for PathQualityDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathQualityDatabase")
            .field("peers", &self.peers.len())
            .field("config", &self.config)
            .finish()
    }
}
