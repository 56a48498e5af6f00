//! Path quality tracking.
//!
//! A [`PathQuality`] couples one [`Path`] with the traffic history observed
//! over it. A [`PathSet`] is a peer address plus an ordered list of such
//! entries; insertion order matters to order-sensitive selectors and is
//! always preserved.

mod database;

pub use database::{DatabaseConfig, PathQualityDatabase};

use std::time::Instant;

use crate::metrics::PathMetrics;
use crate::path::{Path, PathId, PathSetKey};
use crate::types::PeerAddr;

/// One known path to a peer and its accumulated metrics.
#[derive(Debug, Clone)]
pub struct PathQuality {
    pub path: Path,
    pub metrics: PathMetrics,
    /// Last successful refresh that reported this path.
    pub last_seen: Instant,
    /// Consecutive successful refreshes that did not report this path.
    pub absent_rounds: u32,
}

impl PathQuality {
    /// Create a new entry with zeroed metrics.
    pub fn new(path: Path, max_samples: usize) -> Self {
        Self {
            path,
            metrics: PathMetrics::new(max_samples),
            last_seen: Instant::now(),
            absent_rounds: 0,
        }
    }

    pub fn id(&self) -> PathId {
        self.path.id()
    }

    /// Highest bandwidth sample ever recorded, in bytes per second.
    pub fn max_bandwidth(&self) -> u64 {
        self.metrics.max_bandwidth()
    }

    /// Whether the latest refresh reported this path.
    pub fn is_present(&self) -> bool {
        self.absent_rounds == 0
    }
}

/// A peer address plus an ordered sequence of path entries.
#[derive(Debug, Clone)]
pub struct PathSet {
    pub peer: PeerAddr,
    pub paths: Vec<PathQuality>,
}

impl PathSet {
    pub fn new(peer: PeerAddr, paths: Vec<PathQuality>) -> Self {
        Self { peer, paths }
    }

    pub fn empty(peer: PeerAddr) -> Self {
        Self::new(peer, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathQuality> {
        self.paths.iter()
    }

    pub fn ids(&self) -> Vec<PathId> {
        self.paths.iter().map(PathQuality::id).collect()
    }

    /// Canonical identity of this combination of paths.
    pub fn key(&self) -> PathSetKey {
        PathSetKey::new(self.paths.iter().map(PathQuality::id))
    }

    pub fn get(&self, id: &PathId) -> Option<&PathQuality> {
        self.paths.iter().find(|q| q.id() == *id)
    }

    pub fn contains(&self, id: &PathId) -> bool {
        self.get(id).is_some()
    }

    /// Bare paths, in set order.
    pub fn to_paths(&self) -> Vec<Path> {
        self.paths.iter().map(|q| q.path.clone()).collect()
    }

    /// Only the entries reported by the latest refresh.
    #[must_use]
    pub fn available(&self) -> Self {
        Self {
            peer: self.peer,
            paths: self.paths.iter().filter(|q| q.is_present()).cloned().collect(),
        }
    }

    /// Subset of entries matching `ids`, in the order of `ids`.
    #[must_use]
    pub fn select_ids(&self, ids: &[PathId]) -> Self {
        Self {
            peer: self.peer,
            paths: ids.iter().filter_map(|id| self.get(id).cloned()).collect(),
        }
    }

    /// Sum of the latest write samples of all entries, in bytes per second.
    pub fn latest_write_bandwidth(&self) -> u64 {
        self.paths
            .iter()
            .filter_map(|q| q.metrics.latest())
            .map(|s| s.write)
            .sum()
    }
}

impl<'a> IntoIterator for &'a PathSet {
    type Item = &'a PathQuality;
    type IntoIter = std::slice::Iter<'a, PathQuality>;

    fn into_iter(self) -> Self::IntoIter {
        self.paths.iter()
    }
}
