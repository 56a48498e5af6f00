//! Exploring selector that favours paths sharing few interior interfaces.
//!
//! Paths are ranked by hop count, then stably by conflict score. The best
//! `count - explore_slots` paths are always kept; the remaining slots cycle
//! through combinations of the other paths, skipping every combination that
//! the history already contains. Once all combinations were tried the
//! selector returns an empty set and the caller falls back to the best
//! recorded combination.

use tracing::debug;

use super::{SelectionHistory, Selector};
use crate::error::{Error, Result};
use crate::path::{Path, PathSetKey};
use crate::quality::{PathQuality, PathSet};

/// Upper bound on exploring slots. The search space grows combinatorially.
pub const MAX_EXPLORE_SLOTS: usize = 4;

/// Number of interior interfaces shared between two paths.
///
/// Each matching pair counts once. The access links at both ends are
/// excluded, so two paths between the same endpoints that differ in every
/// transit hop do not conflict.
pub fn conflicts(a: &Path, b: &Path) -> usize {
    let theirs = b.interior_interfaces();
    a.interior_interfaces()
        .iter()
        .map(|hop| theirs.iter().filter(|other| *other == hop).count())
        .sum()
}

/// Conflict score of each path: the sum of its conflicts with every path in
/// `paths`, itself included.
pub fn conflict_scores(paths: &[&Path]) -> Vec<usize> {
    paths
        .iter()
        .map(|p| paths.iter().map(|q| conflicts(p, q)).sum())
        .collect()
}

/// Advance `indices` to the next k-combination of `0..n` in lexicographic order.
fn next_combination(indices: &mut [usize], n: usize) -> bool {
    let k = indices.len();
    let Some(i) = (0..k).rev().find(|&i| indices[i] < n - k + i) else {
        return false;
    };
    indices[i] += 1;
    for j in i + 1..k {
        indices[j] = indices[j - 1] + 1;
    }
    true
}

#[derive(Debug, Clone, Copy)]
pub struct DisjointSelector {
    explore_slots: usize,
}

impl DisjointSelector {
    pub fn new(explore_slots: usize) -> Result<Self> {
        if explore_slots > MAX_EXPLORE_SLOTS {
            return Err(Error::InvalidConfig(format!(
                "disjoint selector supports at most {MAX_EXPLORE_SLOTS} explore slots, got {explore_slots}"
            )));
        }
        Ok(Self { explore_slots })
    }

    pub fn explore_slots(&self) -> usize {
        self.explore_slots
    }

    /// Entries ordered by hop count, then by conflict score. Both sorts are stable.
    pub fn rank<'a>(&self, paths: &'a PathSet) -> Vec<&'a PathQuality> {
        let mut by_hops: Vec<&PathQuality> = paths.iter().collect();
        by_hops.sort_by_key(|q| q.path.hop_count());

        let bare: Vec<&Path> = by_hops.iter().map(|q| &q.path).collect();
        let mut scored: Vec<(usize, &PathQuality)> =
            conflict_scores(&bare).into_iter().zip(by_hops).collect();
        scored.sort_by_key(|(score, _)| *score);

        scored.into_iter().map(|(_, q)| q).collect()
    }
}

impl Selector for DisjointSelector {
    fn name(&self) -> &'static str {
        "disjoint"
    }

    fn select(&self, paths: &PathSet, count: usize, history: &SelectionHistory) -> PathSet {
        let ranked = self.rank(paths);
        let total = count.min(ranked.len());
        if total == 0 {
            return PathSet::empty(paths.peer);
        }

        let explore = self.explore_slots.min(total);
        let (fixed, pool) = ranked.split_at(total - explore);

        let mut indices: Vec<usize> = (0..explore).collect();
        loop {
            let candidate: Vec<PathQuality> = fixed
                .iter()
                .copied()
                .chain(indices.iter().map(|&i| pool[i]))
                .cloned()
                .collect();
            let key = PathSetKey::new(candidate.iter().map(PathQuality::id));

            if !history.contains(&key) {
                debug!(peer = %paths.peer, combination = %key, "exploring path combination");
                return PathSet::new(paths.peer, candidate);
            }

            if !next_combination(&mut indices, pool.len()) {
                break;
            }
        }

        debug!(peer = %paths.peer, tried = history.len(), "all path combinations tried");
        PathSet::empty(paths.peer)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::path::{PathId, PathInterface};
    use crate::types::{DomainId, PeerAddr};

    fn peer() -> PeerAddr {
        "1-ff00:0:110,[127.0.0.1]:4000".parse().unwrap()
    }

    fn hop(asn: u64, id: u64) -> PathInterface {
        PathInterface::new(DomainId::new(1, asn), id)
    }

    fn path(hops: &[(u64, u64)]) -> Path {
        Path::new(hops.iter().map(|&(a, i)| hop(a, i)).collect(), 1500)
    }

    fn set(paths: Vec<Path>) -> PathSet {
        PathSet::new(
            peer(),
            paths.into_iter().map(|p| PathQuality::new(p, 8)).collect(),
        )
    }

    #[test]
    fn test_shared_access_links_do_not_conflict() {
        let a = path(&[(1, 1), (10, 1), (2, 1)]);
        let b = path(&[(1, 1), (20, 1), (2, 1)]);
        assert_eq!(conflicts(&a, &b), 0);
        assert_eq!(conflicts(&a, &a), 1);
        assert_eq!(conflict_scores(&[&a, &b]), vec![1, 1]);
    }

    #[test]
    fn test_two_disjoint_paths_then_exhausted() {
        let a = path(&[(1, 1), (10, 1), (2, 1)]);
        let b = path(&[(1, 1), (20, 1), (2, 1)]);
        let paths = set(vec![a.clone(), b.clone()]);
        let selector = DisjointSelector::new(1).unwrap();
        let mut history = SelectionHistory::new();

        let first = selector.select(&paths, 2, &history);
        assert_eq!(first.ids(), vec![a.id(), b.id()]);

        history.record(&first.ids(), 1000);
        let second = selector.select(&paths, 2, &history);
        assert!(second.is_empty());
        assert_eq!(history.best(), Some(first.ids().as_slice()));
    }

    #[test]
    fn test_overlapping_paths_rank_last() {
        let shared_a = path(&[(1, 1), (10, 1), (2, 1)]);
        let shared_b = path(&[(1, 2), (10, 1), (2, 2)]);
        let disjoint = path(&[(1, 1), (30, 1), (2, 1)]);
        let paths = set(vec![shared_a.clone(), shared_b.clone(), disjoint.clone()]);
        let selector = DisjointSelector::new(1).unwrap();

        let ranked: Vec<PathId> = selector.rank(&paths).iter().map(|q| q.id()).collect();
        assert_eq!(ranked, vec![disjoint.id(), shared_a.id(), shared_b.id()]);

        let mut history = SelectionHistory::new();
        let first = selector.select(&paths, 2, &history);
        assert_eq!(first.ids(), vec![disjoint.id(), shared_a.id()]);
        history.record(&first.ids(), 10);

        let second = selector.select(&paths, 2, &history);
        assert_eq!(second.ids(), vec![disjoint.id(), shared_b.id()]);
        history.record(&second.ids(), 20);

        assert!(selector.select(&paths, 2, &history).is_empty());
    }

    #[test]
    fn test_hop_count_breaks_before_score() {
        let long = path(&[(1, 1), (40, 1), (41, 1), (2, 1)]);
        let short = path(&[(1, 1), (2, 1)]);
        let paths = set(vec![long.clone(), short.clone()]);
        let selector = DisjointSelector::new(0).unwrap();

        let out = selector.select(&paths, 1, &SelectionHistory::new());
        assert_eq!(out.ids(), vec![short.id()]);
    }

    #[test]
    fn test_terminates_after_all_combinations() {
        let paths = set((0..5).map(|i| path(&[(1, 1), (100 + i, 1), (2, 1)])).collect());
        let selector = DisjointSelector::new(2).unwrap();
        let mut history = SelectionHistory::new();
        let mut seen = HashSet::new();
        let top = selector.rank(&paths)[0].id();

        loop {
            let picked = selector.select(&paths, 3, &history);
            if picked.is_empty() {
                break;
            }
            assert_eq!(picked.len(), 3);
            assert!(picked.contains(&top));
            assert!(seen.insert(picked.key()), "combination repeated");
            history.record(&picked.ids(), 0);
        }

        // One fixed slot, two explore slots over the remaining four paths.
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn test_count_larger_than_paths() {
        let paths = set(vec![path(&[(1, 1), (10, 1), (2, 1)])]);
        let selector = DisjointSelector::new(2).unwrap();
        let out = selector.select(&paths, 4, &SelectionHistory::new());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_empty_input() {
        let selector = DisjointSelector::new(1).unwrap();
        assert!(selector
            .select(&PathSet::empty(peer()), 2, &SelectionHistory::new())
            .is_empty());
        assert!(selector
            .select(&set(vec![path(&[(1, 1)])]), 0, &SelectionHistory::new())
            .is_empty());
    }

    #[test]
    fn test_rejects_too_many_explore_slots() {
        assert!(DisjointSelector::new(MAX_EXPLORE_SLOTS).is_ok());
        assert!(matches!(
            DisjointSelector::new(MAX_EXPLORE_SLOTS + 1),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_next_combination_order() {
        let mut idx = vec![0, 1];
        let mut all = vec![idx.clone()];
        while next_combination(&mut idx, 4) {
            all.push(idx.clone());
        }
        assert_eq!(
            all,
            vec![
                vec![0, 1],
                vec![0, 2],
                vec![0, 3],
                vec![1, 2],
                vec![1, 3],
                vec![2, 3]
            ]
        );

        let mut none: Vec<usize> = Vec::new();
        assert!(!next_combination(&mut none, 3));
    }
}
