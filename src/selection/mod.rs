//! Path selection strategies.
//!
//! A [`Selector`] is a pure function from a [`PathSet`] and a target count to
//! a selected `PathSet` of at most `count` entries. Selectors never mutate
//! metrics. Ranked selectors use a stable sort, so entries with equal keys
//! keep their original set order and repeated calls return the same result.

mod disjoint;

pub use disjoint::{conflict_scores, conflicts, DisjointSelector, MAX_EXPLORE_SLOTS};

use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::path::{PathId, PathSetKey};
use crate::quality::{PathQuality, PathSet};

/// Path selection strategy.
pub trait Selector: Send + Sync {
    /// Strategy name for logs.
    fn name(&self) -> &'static str;

    /// Pick at most `count` entries of `paths`.
    ///
    /// `history` lists the combinations already tried in earlier rounds.
    /// Only exploring strategies consult it.
    fn select(&self, paths: &PathSet, count: usize, history: &SelectionHistory) -> PathSet;
}

/// Sort `paths` stably by `key` and keep the first `count`.
fn rank_by<K: Ord>(paths: &PathSet, count: usize, key: impl Fn(&PathQuality) -> K) -> PathSet {
    let mut ranked: Vec<&PathQuality> = paths.iter().collect();
    ranked.sort_by_key(|q| key(q));
    PathSet::new(paths.peer, ranked.into_iter().take(count).cloned().collect())
}

/// Highest recorded bandwidth first.
#[derive(Debug, Clone, Copy, Default)]
pub struct BandwidthSelector;

impl Selector for BandwidthSelector {
    fn name(&self) -> &'static str {
        "bandwidth"
    }

    fn select(&self, paths: &PathSet, count: usize, _history: &SelectionHistory) -> PathSet {
        rank_by(paths, count, |q| Reverse(q.max_bandwidth()))
    }
}

/// Lowest summed hop latency first. Unmeasured hops count as zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencySelector;

impl Selector for LatencySelector {
    fn name(&self) -> &'static str {
        "latency"
    }

    fn select(&self, paths: &PathSet, count: usize, _history: &SelectionHistory) -> PathSet {
        rank_by(paths, count, |q| q.path.total_latency())
    }
}

/// Largest MTU first.
#[derive(Debug, Clone, Copy, Default)]
pub struct MtuSelector;

impl Selector for MtuSelector {
    fn name(&self) -> &'static str {
        "mtu"
    }

    fn select(&self, paths: &PathSet, count: usize, _history: &SelectionHistory) -> PathSet {
        rank_by(paths, count, |q| Reverse(q.path.mtu()))
    }
}

/// Fewest hops first.
#[derive(Debug, Clone, Copy, Default)]
pub struct HopCountSelector;

impl Selector for HopCountSelector {
    fn name(&self) -> &'static str {
        "hop_count"
    }

    fn select(&self, paths: &PathSet, count: usize, _history: &SelectionHistory) -> PathSet {
        rank_by(paths, count, |q| q.path.hop_count())
    }
}

/// Selector choice in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    Bandwidth,
    #[default]
    Latency,
    Mtu,
    HopCount,
    Disjoint,
}

impl SelectorKind {
    /// Instantiate the selector. `explore_slots` only applies to `Disjoint`.
    pub fn build(self, explore_slots: usize) -> Result<Arc<dyn Selector>> {
        Ok(match self {
            Self::Bandwidth => Arc::new(BandwidthSelector),
            Self::Latency => Arc::new(LatencySelector),
            Self::Mtu => Arc::new(MtuSelector),
            Self::HopCount => Arc::new(HopCountSelector),
            Self::Disjoint => Arc::new(DisjointSelector::new(explore_slots)?),
        })
    }
}

impl fmt::Display for SelectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bandwidth => write!(f, "bandwidth"),
            Self::Latency => write!(f, "latency"),
            Self::Mtu => write!(f, "mtu"),
            Self::HopCount => write!(f, "hop_count"),
            Self::Disjoint => write!(f, "disjoint"),
        }
    }
}

#[derive(Debug, Clone)]
struct TriedSet {
    paths: Vec<PathId>,
    write_bandwidth: u64,
    order: usize,
}

/// Path combinations tried in earlier exploring rounds.
///
/// Owned by the caller of a selector (the session controller), never by the
/// path database.
#[derive(Debug, Clone, Default)]
pub struct SelectionHistory {
    tried: HashMap<PathSetKey, TriedSet>,
}

impl SelectionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a combination and the write bandwidth observed while it was active.
    /// Recording an already known combination updates its bandwidth.
    pub fn record(&mut self, paths: &[PathId], write_bandwidth: u64) {
        let key = PathSetKey::new(paths.iter().copied());
        let order = self.tried.len();
        self.tried
            .entry(key)
            .and_modify(|t| t.write_bandwidth = write_bandwidth)
            .or_insert_with(|| TriedSet {
                paths: paths.to_vec(),
                write_bandwidth,
                order,
            });
    }

    pub fn contains(&self, key: &PathSetKey) -> bool {
        self.tried.contains_key(key)
    }

    /// Combination with the highest recorded write bandwidth, earliest first on ties.
    pub fn best(&self) -> Option<&[PathId]> {
        self.tried
            .values()
            .max_by_key(|t| (t.write_bandwidth, Reverse(t.order)))
            .map(|t| t.paths.as_slice())
    }

    pub fn write_bandwidth(&self, key: &PathSetKey) -> Option<u64> {
        self.tried.get(key).map(|t| t.write_bandwidth)
    }

    pub fn len(&self) -> usize {
        self.tried.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tried.is_empty()
    }

    pub fn clear(&mut self) {
        self.tried.clear();
    }
}

/// Apply `selector` to the paths reported by the latest refresh.
pub fn select_paths(
    selector: &dyn Selector,
    paths: &PathSet,
    count: usize,
    history: &SelectionHistory,
) -> PathSet {
    selector.select(&paths.available(), count, history)
}
