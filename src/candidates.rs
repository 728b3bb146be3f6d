use crate::consts::WORST_SCORE;
use crate::topology::{Split, Topology};
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Landed in the set at this 0-based rank.
    Inserted(usize),
    /// Rejected: malformed, capacity reached or score too low.
    NotFound,
    /// The topology is already present with an equal or better score.
    DuplicateWorse,
}

impl UpdateOutcome {
    pub fn rank(&self) -> Option<usize> {
        match self {
            UpdateOutcome::Inserted(r) => Some(*r),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub tree: String,
    pub score: f64,
    #[serde(default)]
    pub source: usize,
}

/// Ordering key: better score first, earlier insertion first among ties.
#[derive(Debug, Clone, Copy)]
struct RankKey {
    score: f64,
    seq: u64,
}

impl PartialEq for RankKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RankKey {}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RankKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitRecord {
    pub count: usize,
    pub weight: f64,
}

/// How often each non-trivial split occurs among the current candidates.
#[derive(Debug, Clone, Default)]
pub struct SplitOccurrenceMap {
    splits: FnvHashMap<Split, SplitRecord>,
    tree_count: usize,
    stable_count: usize,
}

impl SplitOccurrenceMap {
    pub fn weight(&self, split: &Split) -> f64 {
        self.splits.get(split).map_or(0.0, |r| r.weight)
    }

    pub fn get(&self, split: &Split) -> Option<&SplitRecord> {
        self.splits.get(split)
    }

    pub fn tree_count(&self) -> usize {
        self.tree_count
    }

    /// Splits that reached the threshold at the last rebuild.
    pub fn stable_count(&self) -> usize {
        self.stable_count
    }

    pub fn len(&self) -> usize {
        self.splits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }
}

/// Bounded, deduplicated population of the best trees found so far.
/// Members are binary trees over exactly the leaves `0..leaf_count`, stored in
/// canonical form and keyed by their topology.
#[derive(Debug, Clone)]
pub struct CandidateSet {
    capacity: usize,
    leaf_count: usize,
    ranking: BTreeMap<RankKey, String>,
    entries: FnvHashMap<String, (RankKey, CandidateRecord)>,
    next_seq: u64,
    occurrences: SplitOccurrenceMap,
}

impl CandidateSet {
    pub fn new(capacity: usize, leaf_count: usize) -> Self {
        Self {
            capacity,
            leaf_count,
            ranking: BTreeMap::new(),
            entries: FnvHashMap::default(),
            next_seq: 0,
            occurrences: SplitOccurrenceMap::default(),
        }
    }

    pub fn from_records(capacity: usize, leaf_count: usize, records: &[CandidateRecord]) -> Self {
        let mut set = Self::new(capacity, leaf_count);
        for r in records {
            set.update_from(&r.tree, r.score, r.source);
        }
        set
    }

    pub fn update(&mut self, tree: &str, score: f64) -> UpdateOutcome {
        self.update_from(tree, score, 0)
    }

    pub fn update_from(&mut self, tree: &str, score: f64, source: usize) -> UpdateOutcome {
        if self.capacity == 0 {
            return UpdateOutcome::NotFound;
        }
        let topo = match Topology::from_newick(tree, self.leaf_count) {
            Ok(t) => t,
            Err(e) => {
                warn!("⚠️  Dropping malformed tree from rank {}: {}", source, e);
                return UpdateOutcome::NotFound;
            }
        };
        let key = topo.topology_string();

        if let Some((old_rank, old)) = self.entries.get(&key) {
            if score <= old.score {
                return UpdateOutcome::DuplicateWorse;
            }
            let old_rank = *old_rank;
            self.ranking.remove(&old_rank);
        } else if self.ranking.len() >= self.capacity {
            let Some(worst) = self.ranking.keys().next_back().map(|k| k.score) else {
                return UpdateOutcome::NotFound;
            };
            if score <= worst {
                return UpdateOutcome::NotFound;
            }
            let oldest_worst = self
                .ranking
                .range(RankKey { score: worst, seq: 0 }..)
                .next()
                .map(|(k, v)| (*k, v.clone()));
            if let Some((rank_key, evicted)) = oldest_worst {
                self.ranking.remove(&rank_key);
                self.entries.remove(&evicted);
                debug!("Evicted candidate with score {:.4}", rank_key.score);
            }
        }

        let rank_key = RankKey {
            score,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.ranking.insert(rank_key, key.clone());
        self.entries.insert(
            key,
            (
                rank_key,
                CandidateRecord {
                    tree: topo.tree_string(),
                    score,
                    source,
                },
            ),
        );
        UpdateOutcome::Inserted(self.ranking.range(..rank_key).count())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    fn key_of(&self, tree: &str) -> Option<String> {
        parse_candidate(tree, self.leaf_count).map(|t| t.topology_string())
    }

    /// Changes the capacity, dropping the worst entries that no longer fit.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.ranking.len() > capacity {
            if let Some((_, key)) = self.ranking.pop_last() {
                self.entries.remove(&key);
            }
        }
    }

    pub fn clear(&mut self) {
        self.ranking.clear();
        self.entries.clear();
        self.occurrences = SplitOccurrenceMap::default();
    }

    pub fn len(&self) -> usize {
        self.ranking.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranking.is_empty()
    }

    pub fn contains(&self, tree: &str) -> bool {
        self.key_of(tree)
            .is_some_and(|key| self.entries.contains_key(&key))
    }

    pub fn score_of(&self, tree: &str) -> Option<f64> {
        let key = self.key_of(tree)?;
        self.entries.get(&key).map(|(_, r)| r.score)
    }

    /// Records in descending score order.
    pub fn iter(&self) -> impl Iterator<Item = &CandidateRecord> + '_ {
        self.ranking
            .values()
            .filter_map(move |key| self.entries.get(key).map(|(_, r)| r))
    }

    pub fn records(&self) -> Vec<CandidateRecord> {
        self.iter().cloned().collect()
    }

    pub fn best_score(&self) -> f64 {
        self.ranking.keys().next().map_or(WORST_SCORE, |k| k.score)
    }

    pub fn best_tree_strings(&self, k: usize) -> Vec<String> {
        self.iter().take(k).map(|r| r.tree.clone()).collect()
    }

    pub fn best_scores(&self, k: usize) -> Vec<f64> {
        self.iter().take(k).map(|r| r.score).collect()
    }

    pub fn best_candidate_trees(&self, k: usize) -> CandidateSet {
        let top: Vec<CandidateRecord> = self.iter().take(k).cloned().collect();
        CandidateSet::from_records(k, self.leaf_count, &top)
    }

    /// Uniform pick among the top `pop_size`; the start of a perturbation.
    pub fn rand_top_tree(&self, pop_size: usize, rng: &mut fastrand::Rng) -> Option<String> {
        let pool = pop_size.min(self.len());
        if pool == 0 {
            return None;
        }
        self.iter().nth(rng.usize(..pool)).map(|r| r.tree.clone())
    }

    /// This process's share of the top `k`: every entry with `index % nprocs == rank`.
    pub fn best_tree_strings_for_process(&self, k: usize, rank: usize, nprocs: usize) -> Vec<String> {
        let nprocs = nprocs.max(1);
        self.iter()
            .take(k)
            .enumerate()
            .filter(|(i, _)| i % nprocs == rank)
            .map(|(_, r)| r.tree.clone())
            .collect()
    }

    pub fn split_occurrences(&self) -> &SplitOccurrenceMap {
        &self.occurrences
    }

    /// Rebuilds the split occurrence table over the current members.
    pub fn compute_split_occurrences(&mut self, stable_threshold: f64) {
        let mut counts: FnvHashMap<Split, usize> = FnvHashMap::default();
        let mut trees = 0usize;
        for record in self.iter() {
            let Some(topo) = parse_candidate(&record.tree, self.leaf_count) else {
                warn!("⚠️  Skipping unparsable candidate in split count");
                continue;
            };
            trees += 1;
            for split in topo.splits() {
                *counts.entry(split).or_insert(0) += 1;
            }
        }
        let splits: FnvHashMap<Split, SplitRecord> = counts
            .into_iter()
            .map(|(s, count)| {
                let weight = if trees == 0 {
                    0.0
                } else {
                    count as f64 / trees as f64
                };
                (s, SplitRecord { count, weight })
            })
            .collect();
        let stable_count = splits
            .values()
            .filter(|r| r.weight >= stable_threshold)
            .count();
        debug!(
            "Split occurrences: {} splits over {} trees, {} stable",
            splits.len(),
            trees,
            stable_count
        );
        self.occurrences = SplitOccurrenceMap {
            splits,
            tree_count: trees,
            stable_count,
        };
    }
}

/// Parses a candidate tree string whose leaves are the numeric ids `0..leaf_count`.
pub fn parse_candidate(tree: &str, leaf_count: usize) -> Option<Topology> {
    Topology::from_newick(tree, leaf_count).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_prefers_oldest_of_tied_worst() {
        let mut set = CandidateSet::new(2, 4);
        set.update("(0,1,(2,3));", -5.0);
        set.update("(0,2,(1,3));", -5.0);
        assert_eq!(set.update("(0,3,(1,2));", -4.0), UpdateOutcome::Inserted(0));
        assert!(!set.contains("(0,1,(2,3));"));
        assert!(set.contains("(0,2,(1,3));"));
    }

    #[test]
    fn shrinking_capacity_drops_worst() {
        let mut set = CandidateSet::new(3, 4);
        set.update("(0,1,(2,3));", -1.0);
        set.update("(0,2,(1,3));", -3.0);
        set.update("(0,3,(1,2));", -2.0);
        set.set_capacity(1);
        assert_eq!(set.best_scores(5), vec![-1.0]);
    }
}
